//! Locating this program's own executable code.
use std::fs;

/// A mapped read+execute range of this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextRegion {
    pub start: usize,
    pub end: usize,
}

impl TextRegion {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end).contains(&addr)
    }

    /// View the region's bytes.
    ///
    /// # Safety
    /// The region must still be mapped readable, which holds for the segment
    /// of the running executable.
    pub unsafe fn as_bytes(&self) -> &'static [u8] {
        std::slice::from_raw_parts(self.start as *const u8, self.len())
    }
}

/// Parse one /proc/<pid>/maps line into an executable region.
pub fn parse_maps_line(line: &str) -> Option<TextRegion> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    if !perms.starts_with("r-x") && !perms.starts_with("rwx") {
        return None;
    }
    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    (end > start).then_some(TextRegion { start, end })
}

/// Executable mapping holding `addr`.
pub fn region_containing(maps: &str, addr: usize) -> Option<TextRegion> {
    maps.lines()
        .filter_map(parse_maps_line)
        .find(|region| region.contains(addr))
}

/// This program's text segment.
pub fn resolve_text_region() -> Option<TextRegion> {
    let maps = match fs::read_to_string("/proc/self/maps") {
        Ok(maps) => maps,
        Err(e) => {
            log::warn!("Cannot read /proc/self/maps: {}", e);
            return None;
        }
    };
    let anchor = resolve_text_region as fn() -> Option<TextRegion> as usize;
    let region = region_containing(&maps, anchor);
    if let Some(region) = region {
        log::debug!("Text segment {:#x}-{:#x} ({} bytes)", region.start, region.end, region.len());
    }
    region
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a20000 r--p 00000000 08:01 1234 /usr/bin/opcodebox
55d0c0a20000-55d0c0b40000 r-xp 00020000 08:01 1234 /usr/bin/opcodebox
55d0c0b40000-55d0c0b80000 rw-p 00140000 08:01 1234 /usr/bin/opcodebox
7ffd1c000000-7ffd1c021000 rw-p 00000000 00:00 0 [stack]";

    #[test]
    fn only_executable_lines_parse() {
        let regions: Vec<_> = MAPS.lines().filter_map(parse_maps_line).collect();
        assert_eq!(
            regions,
            vec![TextRegion {
                start: 0x55d0_c0a2_0000,
                end: 0x55d0_c0b4_0000
            }]
        );
    }

    #[test]
    fn finds_region_by_address() {
        let region = region_containing(MAPS, 0x55d0_c0a3_0000).unwrap();
        assert_eq!(region.len(), 0x12_0000);
        assert!(region_containing(MAPS, 0x55d0_c0a1_0000).is_none());
    }

    #[test]
    fn garbage_is_skipped() {
        assert!(parse_maps_line("").is_none());
        assert!(parse_maps_line("zzzz r-xp").is_none());
        assert!(parse_maps_line("2000-1000 r-xp 0 0:0 0").is_none());
    }

    #[test]
    fn own_text_contains_this_function() {
        let region = resolve_text_region().expect("text segment");
        assert!(region.contains(own_text_contains_this_function as fn() as usize));
        assert!(!region.is_empty());
    }
}
