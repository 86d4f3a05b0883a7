//! The SETTINGS frame parameter set.
//!
//! Values are stored at internal indices; two identifiers are remapped
//! when crossing the wire: MAX_CONCURRENT_STREAMS is wire id 3 but
//! internal index 4, and INITIAL_WINDOW_SIZE is wire id 4 but internal
//! index 7.

pub(crate) const HEADER_TABLE_SIZE: usize = 1;
pub(crate) const ENABLE_PUSH: usize = 2;
pub(crate) const MAX_CONCURRENT_STREAMS: usize = 4;
pub(crate) const MAX_FRAME_SIZE: usize = 5;
pub(crate) const MAX_HEADER_LIST_SIZE: usize = 6;
pub(crate) const INITIAL_WINDOW_SIZE: usize = 7;

pub(crate) const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;

const COUNT: usize = 10;

/// A sparse set of HTTP/2 settings.
#[derive(Clone, Debug, Default)]
pub(crate) struct Settings {
    set: u32,
    values: [u32; COUNT],
}

impl Settings {
    pub(crate) fn new() -> Settings {
        Settings::default()
    }

    pub(crate) fn set(&mut self, id: usize, value: u32) -> &mut Settings {
        if id < COUNT {
            self.set |= 1 << id;
            self.values[id] = value;
        }
        self
    }

    pub(crate) fn is_set(&self, id: usize) -> bool {
        id < COUNT && self.set & (1 << id) != 0
    }

    fn get(&self, id: usize, default: u32) -> u32 {
        if self.is_set(id) {
            self.values[id]
        } else {
            default
        }
    }

    pub(crate) fn header_table_size(&self) -> u32 {
        self.get(HEADER_TABLE_SIZE, 4096)
    }

    pub(crate) fn enable_push(&self) -> bool {
        self.get(ENABLE_PUSH, 1) == 1
    }

    pub(crate) fn max_concurrent_streams(&self) -> u32 {
        self.get(MAX_CONCURRENT_STREAMS, u32::MAX)
    }

    pub(crate) fn max_frame_size(&self) -> u32 {
        self.get(MAX_FRAME_SIZE, super::frame::INITIAL_MAX_FRAME_SIZE)
    }

    pub(crate) fn max_header_list_size(&self) -> u32 {
        self.get(MAX_HEADER_LIST_SIZE, u32::MAX)
    }

    pub(crate) fn initial_window_size(&self) -> u32 {
        self.get(INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Overwrites this set with every value present in `other`.
    pub(crate) fn merge(&mut self, other: &Settings) {
        for id in 0..COUNT {
            if other.is_set(id) {
                self.set(id, other.values[id]);
            }
        }
    }

    /// The `(wire id, value)` pairs of every set parameter.
    pub(crate) fn wire_entries(&self) -> Vec<(u16, u32)> {
        (0..COUNT)
            .filter(|&id| self.is_set(id))
            .map(|id| (internal_to_wire(id), self.values[id]))
            .collect()
    }
}

fn internal_to_wire(id: usize) -> u16 {
    match id {
        MAX_CONCURRENT_STREAMS => 3,
        INITIAL_WINDOW_SIZE => 4,
        other => other as u16,
    }
}

pub(crate) fn wire_to_internal(id: u16) -> Option<usize> {
    Some(match id {
        1 => HEADER_TABLE_SIZE,
        2 => ENABLE_PUSH,
        3 => MAX_CONCURRENT_STREAMS,
        4 => INITIAL_WINDOW_SIZE,
        5 => MAX_FRAME_SIZE,
        6 => MAX_HEADER_LIST_SIZE,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_unset() {
        let settings = Settings::new();
        assert_eq!(settings.header_table_size(), 4096);
        assert!(settings.enable_push());
        assert_eq!(settings.max_concurrent_streams(), u32::MAX);
        assert_eq!(settings.max_frame_size(), 16_384);
        assert_eq!(settings.initial_window_size(), 65_535);
    }

    #[test]
    fn wire_remap() {
        let mut settings = Settings::new();
        settings.set(MAX_CONCURRENT_STREAMS, 100);
        settings.set(INITIAL_WINDOW_SIZE, 131_072);
        settings.set(MAX_FRAME_SIZE, 32_768);
        let entries = settings.wire_entries();
        assert!(entries.contains(&(3, 100)));
        assert!(entries.contains(&(4, 131_072)));
        assert!(entries.contains(&(5, 32_768)));

        assert_eq!(wire_to_internal(3), Some(MAX_CONCURRENT_STREAMS));
        assert_eq!(wire_to_internal(4), Some(INITIAL_WINDOW_SIZE));
        assert_eq!(wire_to_internal(9), None);
    }

    #[test]
    fn merge_overwrites() {
        let mut a = Settings::new();
        a.set(HEADER_TABLE_SIZE, 4096);
        let mut b = Settings::new();
        b.set(HEADER_TABLE_SIZE, 8192);
        b.set(ENABLE_PUSH, 0);
        a.merge(&b);
        assert_eq!(a.header_table_size(), 8192);
        assert!(!a.enable_push());
    }
}
