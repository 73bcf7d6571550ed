//! Drives points of many functions through placement and emits the output.

use super::anchor::{AddressAnchor, AnchorTarget};
use super::point::{InstrumentationPoint, PointState};
use super::InstrumentError;
use crate::encoder::{Encoder, JUMP_SIZE};
use crate::function::Function;
use crate::insn::Instruction;
use crate::liveness::Liveness;
use crate::{Address, TargetWidth};

/// Collects points, places their trampolines one after another in a new
/// text region starting at `region_base`, and patches the original sites.
#[derive(Debug)]
pub struct Rewriter {
    encoder: Encoder,
    region_base: Address,
    region_size: usize,
    points: Vec<InstrumentationPoint>,
    dropped: usize,
}

impl Rewriter {
    pub fn new(width: TargetWidth, region_base: Address) -> Self {
        Self {
            encoder: Encoder::new(width),
            region_base,
            region_size: 0,
            points: Vec::new(),
            dropped: 0,
        }
    }

    pub fn add_point(&mut self, point: InstrumentationPoint) -> usize {
        self.points.push(point);
        self.points.len() - 1
    }

    pub fn points(&self) -> &[InstrumentationPoint] {
        &self.points
    }

    pub fn region_base(&self) -> Address {
        self.region_base
    }

    /// Bytes of trampolines placed so far.
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    /// Points given up on.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Analyze, generate and place every requested point inside `function`.
    /// Points that cannot be honoured are dropped with a warning; encoding
    /// failures abort. Returns the number of points placed.
    pub fn instrument(&mut self, function: &Function, liveness: &Liveness) -> Result<usize, InstrumentError> {
        self.points.sort_by_key(|p| (p.address(), p.location()));

        let mut taken: Vec<(Address, Address)> = self
            .points
            .iter()
            .filter(|p| p.state() >= PointState::TrampolineGenerated)
            .filter_map(|p| p.site().map(|s| (s, s + p.displaced_size() as Address)))
            .filter(|&(s, _)| function.in_range(s))
            .collect();

        let mut placed = 0;
        let mut drop = Vec::new();
        for (i, point) in self.points.iter_mut().enumerate() {
            if point.state() != PointState::Requested || !function.in_range(point.address()) {
                continue;
            }
            match prepare(point, function, liveness, &self.encoder, &taken) {
                Ok(range) => {
                    taken.push(range);
                    let at = self.region_base + self.region_size as Address;
                    self.region_size += point.place(at)?;
                    placed += 1;
                }
                Err(e) if e.drops_point() => {
                    log::warn!(
                        "{}: dropping instrumentation point at 0x{:x}: {}",
                        function.name(),
                        point.address(),
                        e
                    );
                    drop.push(i);
                }
                Err(e) => return Err(e),
            }
        }
        for i in drop.into_iter().rev() {
            self.points.remove(i);
            self.dropped += 1;
        }
        log::info!(
            "{}: placed {} instrumentation points, region now {} bytes",
            function.name(),
            placed,
            self.region_size
        );
        Ok(placed)
    }

    fn trampoline_addresses(&self) -> Vec<Option<Address>> {
        self.points
            .iter()
            .map(|p| p.trampoline().and_then(|t| t.address))
            .collect()
    }

    /// The jump to trampoline `index` followed by no-op padding, at `site`.
    fn site_patch(
        &self,
        index: usize,
        site: Address,
        displaced: usize,
        trampolines: &[Option<Address>],
    ) -> Result<Vec<Instruction>, InstrumentError> {
        let mut jmp = self.encoder.jmp_near(site, site)?;
        let anchor = AddressAnchor::new(0, AnchorTarget::Trampoline(index));
        let target = anchor
            .resolve(trampolines)
            .ok_or(InstrumentError::UnresolvedAnchor { address: site })?;
        anchor.link(&mut jmp, target)?;
        let mut patch = vec![jmp];
        patch.extend(self.encoder.nops(displaced.saturating_sub(JUMP_SIZE)));
        let mut at = site;
        for insn in patch.iter_mut() {
            insn.address = at;
            at += insn.size() as Address;
        }
        Ok(patch)
    }

    /// Write every placed trampoline into a fresh region buffer and patch
    /// the sites in `text`, which holds the original text starting at
    /// `text_base`. Returns the region bytes.
    pub fn dump(&mut self, text: &mut [u8], text_base: Address) -> Result<Vec<u8>, InstrumentError> {
        let trampolines = self.trampoline_addresses();
        let mut region = vec![0u8; self.region_size];

        let mut patches = Vec::new();
        for (i, point) in self.points.iter().enumerate() {
            if point.state() != PointState::Placed {
                continue;
            }
            if let Some(site) = point.site() {
                patches.push(self.site_patch(i, site, point.displaced_size(), &trampolines)?);
            }
        }
        for point in self.points.iter_mut() {
            if point.state() == PointState::Placed {
                point.dump(&mut region, self.region_base, &trampolines)?;
            }
        }

        for patch in patches {
            let Some(first) = patch.first() else {
                continue;
            };
            let bytes: Vec<u8> = patch.iter().flat_map(|i| i.bytes.iter().copied()).collect();
            let start = first
                .address
                .checked_sub(text_base)
                .map(|o| o as usize)
                .filter(|&o| o + bytes.len() <= text.len())
                .ok_or(InstrumentError::OutOfBounds {
                    address: first.address,
                    size: bytes.len(),
                })?;
            text[start..start + bytes.len()].copy_from_slice(&bytes);
        }
        log::debug!(
            "Dumped {} trampolines ({} bytes) at 0x{:x}",
            trampolines.iter().flatten().count(),
            region.len(),
            self.region_base
        );
        Ok(region)
    }

    /// Apply the site jumps of placed points to the function's own
    /// instructions. Returns the number of sites patched.
    pub fn patch_function(&self, function: &mut Function) -> Result<usize, InstrumentError> {
        let trampolines = self.trampoline_addresses();
        let mut patched = 0;
        for (i, point) in self.points.iter().enumerate() {
            if point.state() < PointState::Placed {
                continue;
            }
            let Some(site) = point.site().filter(|&s| function.in_range(s)) else {
                continue;
            };
            let mut patch = self.site_patch(i, site, point.displaced_size(), &trampolines)?;
            patch.truncate(1);
            function
                .swap_instructions(&self.encoder, site, patch)
                .map_err(|e| {
                    log::warn!("Cannot patch site 0x{:x}: {}", site, e);
                    InstrumentError::NotInFunction { address: site }
                })?;
            patched += 1;
        }
        Ok(patched)
    }
}

fn prepare(
    point: &mut InstrumentationPoint,
    function: &Function,
    liveness: &Liveness,
    encoder: &Encoder,
    taken: &[(Address, Address)],
) -> Result<(Address, Address), InstrumentError> {
    point.analyze_protection(function, liveness, encoder.width())?;
    point.generate_trampoline(function, encoder)?;
    let site = point.site().unwrap_or(point.address());
    let end = site + point.displaced_size() as Address;
    if taken.iter().any(|&(lo, hi)| site < hi && lo < end) {
        return Err(InstrumentError::Overlap {
            address: point.address(),
        });
    }
    Ok((site, end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::X86Decoder;
    use crate::instrument::{Instrumentation, Location};
    use crate::liveness::LivenessAnalyzer;
    use crate::strategy::{linear, DisassemblyContext};

    // 0: push rbp ; 1: mov rbp,rsp ; 4: test edi,edi ; 6: je 0xd
    // 8: mov eax,1 ; d: pop rbp ; e: ret
    const SIMPLE: [u8; 15] = [
        0x55, 0x48, 0x89, 0xe5, 0x85, 0xff, 0x74, 0x05, 0xb8, 0x01, 0x00, 0x00, 0x00, 0x5d, 0xc3,
    ];
    const REGION: Address = 0x40_0000;

    fn setup() -> (Function, Liveness) {
        let decoder = X86Decoder::new(TargetWidth::Bits64);
        let mut ctx = DisassemblyContext::new();
        let mut f = Function::new("simple", 0x1000, SIMPLE.to_vec());
        f.digest(&decoder, &mut ctx).unwrap();
        let live = LivenessAnalyzer::analyze(f.graph().unwrap());
        (f, live)
    }

    fn call(at: Address) -> InstrumentationPoint {
        InstrumentationPoint::new(at, Location::Before, Instrumentation::Call { target: 0x9000 })
    }

    fn rewriter_with_points() -> (Rewriter, Function, Liveness) {
        let (f, live) = setup();
        let mut rw = Rewriter::new(TargetWidth::Bits64, REGION);
        rw.add_point(call(0x1000));
        // inside the first point's patch
        rw.add_point(call(0x1004));
        // block too short
        rw.add_point(call(0x100d));
        rw.add_point(call(0x1008));
        (rw, f, live)
    }

    #[test]
    fn test_instrument_places_and_drops() {
        let (mut rw, f, live) = rewriter_with_points();
        assert_eq!(rw.instrument(&f, &live).unwrap(), 2);
        assert_eq!(rw.dropped(), 2);
        assert_eq!(rw.points().len(), 2);
        assert!(rw.points().iter().all(|p| p.state() == PointState::Placed));
        let first = rw.points()[0].trampoline().unwrap();
        assert_eq!(first.address, Some(REGION));
        let second = rw.points()[1].trampoline().unwrap();
        assert_eq!(second.address, Some(REGION + first.size() as Address));
        assert_eq!(rw.region_size(), first.size() + second.size());
    }

    #[test]
    fn test_dump_patches_sites() {
        let (mut rw, f, live) = rewriter_with_points();
        rw.instrument(&f, &live).unwrap();
        let mut text = SIMPLE.to_vec();
        let region = rw.dump(&mut text, 0x1000).unwrap();
        assert_eq!(region.len(), rw.region_size());
        assert!(rw.points().iter().all(|p| p.state() == PointState::Dumped));

        let decoder = X86Decoder::new(TargetWidth::Bits64);
        let jmp = decoder.decode(&text, 0x1000).unwrap().0;
        assert_eq!(jmp.control_target(), Some(REGION));
        assert_eq!(text[5], 0x90);
        let second = rw.points()[1].trampoline().unwrap().address.unwrap();
        let jmp2 = decoder.decode(&text[8..], 0x1008).unwrap().0;
        assert_eq!(jmp2.control_target(), Some(second));
        // untouched code keeps its bytes
        assert_eq!(&text[6..8], &SIMPLE[6..8]);
        assert_eq!(&text[13..], &SIMPLE[13..]);

        // the first trampoline ends by jumping back past the displaced bytes
        let size = rw.points()[0].trampoline().unwrap().size();
        let insns = linear::run(&region[..size], REGION, &decoder).unwrap();
        assert_eq!(insns.last().unwrap().control_target(), Some(0x1006));
        assert!(insns.iter().any(|i| i.is_call() && i.control_target() == Some(0x9000)));
    }

    #[test]
    fn test_dump_out_of_bounds() {
        let (mut rw, f, live) = rewriter_with_points();
        rw.instrument(&f, &live).unwrap();
        let mut text = vec![0u8; 4];
        assert!(matches!(
            rw.dump(&mut text, 0x1000),
            Err(InstrumentError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_patch_function_matches_dump() {
        let (mut rw, f, live) = rewriter_with_points();
        rw.instrument(&f, &live).unwrap();
        let mut patched = f.clone();
        assert_eq!(rw.patch_function(&mut patched).unwrap(), 2);
        let mut text = SIMPLE.to_vec();
        rw.dump(&mut text, 0x1000).unwrap();
        assert_eq!(patched.dump(), text);
    }

    #[test]
    fn test_points_outside_function_wait() {
        let (f, live) = setup();
        let mut rw = Rewriter::new(TargetWidth::Bits64, REGION);
        rw.add_point(call(0x5000));
        assert_eq!(rw.instrument(&f, &live).unwrap(), 0);
        assert_eq!(rw.points()[0].state(), PointState::Requested);
        assert_eq!(rw.dropped(), 0);
    }
}
