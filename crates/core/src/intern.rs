//! Process-wide string interning.
//!
//! Every identifier-like string in the system (variable names, field
//! names, string literals, chunk names) is interned exactly once; the
//! rest of the pipeline passes around [`Istr`] handles. Equality and
//! hashing compare table indices, never bytes.
//!
//! The table is created on first use and lives for the rest of the
//! process. There is no eviction: interned text is leaked into `'static`
//! storage so handles can hand out `&'static str` without holding the
//! table lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, OnceLock};

/// Handle to an interned string.
///
/// Copyable, and cheap to compare: two handles are equal iff they were
/// interned from equal text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Istr(u32);

struct Interner {
    map: HashMap<&'static str, u32>,
    strings: Vec<&'static str>,
}

fn table() -> &'static Mutex<Interner> {
    static TABLE: OnceLock<Mutex<Interner>> = OnceLock::new();
    TABLE.get_or_init(|| {
        Mutex::new(Interner {
            map: HashMap::new(),
            strings: Vec::new(),
        })
    })
}

impl Istr {
    /// Intern `text`, returning its stable handle. Re-interning the same
    /// text returns the same handle.
    pub fn new(text: &str) -> Istr {
        let mut t = table().lock().expect("intern table lock poisoned");
        if let Some(&idx) = t.map.get(text) {
            return Istr(idx);
        }
        let stored: &'static str = Box::leak(text.to_owned().into_boxed_str());
        let idx = u32::try_from(t.strings.len()).expect("intern table overflow");
        t.strings.push(stored);
        t.map.insert(stored, idx);
        Istr(idx)
    }

    /// The interned text. Entries are never evicted, so the reference is
    /// valid for the rest of the process.
    pub fn as_str(self) -> &'static str {
        let t = table().lock().expect("intern table lock poisoned");
        t.strings[self.0 as usize]
    }

    /// Concatenate two interned strings, interning the result.
    pub fn concat(self, other: Istr) -> Istr {
        let a = self.as_str();
        let b = other.as_str();
        let mut buf = String::with_capacity(a.len() + b.len());
        buf.push_str(a);
        buf.push_str(b);
        Istr::new(&buf)
    }

    /// The handle's table index (diagnostics only).
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Istr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Istr {
    fn from(text: &str) -> Istr {
        Istr::new(text)
    }
}

/// Number of distinct strings currently interned (diagnostics only).
pub fn interned_count() -> usize {
    table().lock().expect("intern table lock poisoned").strings.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn same_text_same_handle() {
        let a = Istr::new("counter");
        let b = Istr::new("counter");
        assert_eq!(a, b);
        assert_eq!(a.index(), b.index());
    }

    #[test]
    fn different_text_different_handle() {
        assert_ne!(Istr::new("left"), Istr::new("right"));
    }

    #[test]
    fn round_trips_text() {
        let s = Istr::new("ワタシ");
        assert_eq!(s.as_str(), "ワタシ");
        assert_eq!(s.to_string(), "ワタシ");
    }

    #[test]
    fn concat_interns_the_joined_text() {
        let joined = Istr::new("foo").concat(Istr::new("bar"));
        assert_eq!(joined, Istr::new("foobar"));
        assert_eq!(joined.as_str(), "foobar");
    }

    #[test]
    #[serial]
    fn handles_are_pointer_stable() {
        let first = Istr::new("stability-probe").as_str().as_ptr();
        // Grow the table, then look the original up again.
        for i in 0..64 {
            Istr::new(&format!("stability-filler-{i}"));
        }
        let second = Istr::new("stability-probe").as_str().as_ptr();
        assert_eq!(first, second);
    }

    #[test]
    #[serial]
    fn count_tracks_distinct_strings() {
        let before = interned_count();
        Istr::new("count-probe-one");
        Istr::new("count-probe-two");
        assert!(interned_count() >= before + 2);
    }
}
