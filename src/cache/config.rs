//! Cache description files.
//!
//! One hierarchy per line:
//!
//! ```text
//! # sysid levels (size assoc line policy)*
//! 0 2 32k 8 64 lru 1m 16 64 trulru
//! 1 1 4096 1 64 dir_vc
//! ```
//!
//! Sizes take an optional `k`, `m` or `g` multiplier with an optional
//! trailing `b`. A policy token ending in `_vc` makes that level, and every
//! level after it, a victim level. Anything after a `#` is ignored.

use std::path::Path;

use super::{CacheKind, CacheLevel, MemoryHierarchy, ReplacementPolicy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("line {line}: {reason}")]
    Malformed { line: usize, reason: String },

    #[error("line {line}: sysid {sysid} is not a valid hierarchy: {reason}")]
    Invalid { line: usize, sysid: u32, reason: String },

    #[error("no cache hierarchy described")]
    Empty,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn malformed(line: usize, reason: impl Into<String>) -> ConfigError {
    ConfigError::Malformed {
        line,
        reason: reason.into(),
    }
}

/// Parse a count with an optional `k`/`m`/`g` (binary) multiplier.
fn parse_size(token: &str, min: u32) -> Option<u32> {
    let lower = token.to_lowercase();
    let body = lower.strip_suffix('b').unwrap_or(&lower);
    let (digits, mult) = match body.chars().last()? {
        'k' => (&body[..body.len() - 1], 1u64 << 10),
        'm' => (&body[..body.len() - 1], 1u64 << 20),
        'g' => (&body[..body.len() - 1], 1u64 << 30),
        _ => (body, 1),
    };
    let value = digits.parse::<u64>().ok()?.checked_mul(mult)?;
    u32::try_from(value).ok().filter(|&v| v >= min)
}

/// Parse one description line into a hierarchy. `line` is 1-based and only
/// used in errors. Returns `None` for blank and comment-only lines.
pub fn parse_line(text: &str, line: usize) -> Result<Option<MemoryHierarchy>, ConfigError> {
    let content = text.split('#').next().unwrap_or("");
    let tokens: Vec<&str> = content.split_whitespace().collect();
    if tokens.is_empty() {
        return Ok(None);
    }
    if tokens.len() < 2 {
        return Err(malformed(line, "expected a sysid and a level count"));
    }
    let sysid = parse_size(tokens[0], 0).ok_or_else(|| malformed(line, format!("bad sysid '{}'", tokens[0])))?;
    let count = parse_size(tokens[1], 1)
        .ok_or_else(|| malformed(line, format!("bad level count '{}'", tokens[1])))? as usize;
    if tokens.len() != count * 4 + 2 {
        return Err(malformed(
            line,
            format!("{} levels need {} tokens, found {}", count, count * 4 + 2, tokens.len()),
        ));
    }

    let mut levels = Vec::with_capacity(count);
    let mut victim = false;
    for (i, fields) in tokens[2..].chunks(4).enumerate() {
        let size = parse_size(fields[0], 1).ok_or_else(|| malformed(line, format!("bad size '{}'", fields[0])))?;
        let assoc = parse_size(fields[1], 1)
            .ok_or_else(|| malformed(line, format!("bad associativity '{}'", fields[1])))?;
        let line_size = parse_size(fields[2], 1)
            .ok_or_else(|| malformed(line, format!("bad line size '{}'", fields[2])))?;
        let policy: ReplacementPolicy = fields[3].parse().map_err(|e: String| malformed(line, e))?;

        if !line_size.is_power_of_two() {
            return Err(malformed(line, format!("line size {} is not a power of two", line_size)));
        }
        if (size as u64) < line_size as u64 * assoc as u64 {
            return Err(malformed(
                line,
                format!("level {} holds less than one set", i),
            ));
        }
        if fields[3].to_lowercase().ends_with("_vc") {
            victim = true;
        } else if victim {
            log::warn!(
                "line {}: sysid {} level {} follows a victim level, treating it as one",
                line,
                sysid,
                i
            );
        }
        let kind = if victim { CacheKind::Victim } else { CacheKind::Inclusive };
        levels.push(CacheLevel::new(i, size, assoc, line_size, policy, kind));
    }

    let hierarchy = MemoryHierarchy::new(sysid, levels);
    let problems = hierarchy.verify();
    if let Some(reason) = problems.into_iter().next() {
        return Err(ConfigError::Invalid { line, sysid, reason });
    }
    Ok(Some(hierarchy))
}

/// Parse every hierarchy described in `text`.
pub fn parse_hierarchies(text: &str) -> Result<Vec<MemoryHierarchy>, ConfigError> {
    let mut out = Vec::new();
    for (i, l) in text.lines().enumerate() {
        if let Some(h) = parse_line(l, i + 1)? {
            out.push(h);
        }
    }
    if out.is_empty() {
        return Err(ConfigError::Empty);
    }
    log::info!("Loaded {} cache hierarchies", out.len());
    Ok(out)
}

pub fn load_hierarchies(path: impl AsRef<Path>) -> Result<Vec<MemoryHierarchy>, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    parse_hierarchies(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    #[rstest]
    #[case("64", Some(64))]
    #[case("32k", Some(32 * 1024))]
    #[case("32KB", Some(32 * 1024))]
    #[case("2m", Some(2 << 20))]
    #[case("1g", Some(1 << 30))]
    #[case("8g", None)]
    #[case("12x", None)]
    #[case("0", None)]
    fn test_parse_size(#[case] token: &str, #[case] expected: Option<u32>) {
        assert_eq!(parse_size(token, 1), expected);
    }

    #[test]
    fn test_parse_hierarchies() {
        let text = "\
# sysid levels (size assoc line policy)*
0 2 32k 8 64 lru 1m 16 64 trulru

1 1 256 1 64 dir  # direct mapped
";
        let hs = parse_hierarchies(text).unwrap();
        assert_eq!(hs.len(), 2);
        assert_eq!(hs[0].sysid(), 0);
        assert_eq!(hs[0].level_count(), 2);
        let l1 = &hs[0].levels()[0];
        assert_eq!(l1.size(), 32 * 1024);
        assert_eq!(l1.associativity(), 8);
        assert_eq!(l1.policy(), ReplacementPolicy::Nmru);
        assert_eq!(l1.set_count(), 64);
        assert_eq!(hs[0].levels()[1].policy(), ReplacementPolicy::TrueLru);
        assert_eq!(hs[1].levels()[0].set_count(), 4);
    }

    #[test]
    fn test_victim_suffix() {
        let hs = parse_hierarchies("3 2 64 1 64 dir 128 2 64 lru_vc").unwrap();
        let kinds: Vec<CacheKind> = hs[0].levels().iter().map(|l| l.kind()).collect();
        assert_eq!(kinds, vec![CacheKind::Inclusive, CacheKind::Victim]);
    }

    #[rstest]
    #[case("0 2 32k 8 64 lru", 1)]
    #[case("\n0 1 32k 8 64 fifo", 2)]
    #[case("# c\n\n0 1 32k 8 63 lru", 3)]
    #[case("x 1 32k 8 64 lru", 1)]
    #[case("0 1 64 2 64 lru", 1)]
    fn test_malformed_lines(#[case] text: &str, #[case] expected_line: usize) {
        match parse_hierarchies(text) {
            Err(ConfigError::Malformed { line, .. }) => assert_eq!(line, expected_line),
            other => panic!("expected a malformed line error, got {:?}", other),
        }
    }

    #[test]
    fn test_victim_set_mismatch_is_invalid() {
        let err = parse_hierarchies("0 2 64 1 64 dir_vc 4096 1 64 dir_vc").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { line: 1, sysid: 0, .. }));
    }

    #[test]
    fn test_empty_description() {
        assert!(matches!(parse_hierarchies("# nothing\n"), Err(ConfigError::Empty)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "7 1 4k 4 64 rand").unwrap();
        let hs = load_hierarchies(file.path()).unwrap();
        assert_eq!(hs[0].sysid(), 7);
        assert_eq!(hs[0].levels()[0].policy(), ReplacementPolicy::Random);
    }
}
