use std::borrow::Cow;
use std::ffi::CStr;
use std::fmt;

/// Longest name an [`InlineName`] keeps; longer names are cut.
pub const NAME_CAPACITY: usize = 512;

/// A name copied out of the loader's string tables.
///
/// Stored inline, so resolving never allocates and the name stays valid after
/// the image it came from is unloaded.
#[derive(Clone, Copy)]
pub struct InlineName {
    bytes: [u8; NAME_CAPACITY],
    len: usize,
    truncated: bool,
}

impl InlineName {
    pub fn new(name: &CStr) -> Self {
        let source = name.to_bytes();
        let len = source.len().min(NAME_CAPACITY);
        let mut bytes = [0u8; NAME_CAPACITY];
        bytes[..len].copy_from_slice(&source[..len]);
        Self {
            bytes,
            len,
            truncated: source.len() > NAME_CAPACITY,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the source name was longer than [`NAME_CAPACITY`].
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn to_string_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.as_bytes())
    }
}

impl PartialEq for InlineName {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes() && self.truncated == other.truncated
    }
}

impl Eq for InlineName {}

impl fmt::Debug for InlineName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("InlineName")
            .field(&self.to_string_lossy())
            .finish()
    }
}

/// What a [`Symbolicator`] knows about one code address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Symbol {
    pub image_name: Option<InlineName>,
    pub image_address: usize,
    pub symbol_name: Option<InlineName>,
    pub symbol_address: usize,
}

/// Resolves code addresses to images and symbols.
///
/// Implementations must not block or allocate if they are going to be used
/// from a crash handler.
pub trait Symbolicator {
    fn resolve(&self, address: usize) -> Option<Symbol>;
}

/// Resolves nothing. Used where only raw addresses are wanted.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSymbolicator;

impl Symbolicator for NoSymbolicator {
    fn resolve(&self, _address: usize) -> Option<Symbol> {
        None
    }
}

/// Resolves through the dynamic loader's `dladdr`.
///
/// Only exported symbols are found; static functions resolve to their image
/// with no symbol name.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct DladdrSymbolicator;

#[cfg(unix)]
impl Symbolicator for DladdrSymbolicator {
    fn resolve(&self, address: usize) -> Option<Symbol> {
        if address == 0 {
            return None;
        }
        let mut info = std::mem::MaybeUninit::<libc::Dl_info>::zeroed();
        let ok = unsafe { libc::dladdr(address as *const libc::c_void, info.as_mut_ptr()) };
        if ok == 0 {
            return None;
        }
        let info = unsafe { info.assume_init() };
        if info.dli_fbase.is_null() {
            return None;
        }

        // The loader's strings live only as long as the image; copy them now.
        let image_name = (!info.dli_fname.is_null())
            .then(|| InlineName::new(unsafe { CStr::from_ptr(info.dli_fname) }));
        let symbol_name = (!info.dli_sname.is_null())
            .then(|| InlineName::new(unsafe { CStr::from_ptr(info.dli_sname) }));
        Some(Symbol {
            image_name,
            image_address: info.dli_fbase as usize,
            symbol_name,
            symbol_address: if symbol_name.is_some() {
                info.dli_saddr as usize
            } else {
                0
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_symbolicator_resolves_nothing() {
        assert_eq!(NoSymbolicator.resolve(0x1000), None);
    }

    #[cfg(unix)]
    #[test]
    fn dladdr_finds_the_image_of_libc_functions() {
        let address = libc::getpid as usize;
        let symbol = DladdrSymbolicator
            .resolve(address)
            .expect("libc should be a loaded image");
        assert!(symbol.image_name.is_some());
        assert_ne!(symbol.image_address, 0);
        assert!(symbol.image_address <= address);
        if symbol.symbol_name.is_some() {
            assert!(symbol.symbol_address <= address);
        }
    }

    #[cfg(unix)]
    #[test]
    fn dladdr_rejects_null_and_unmapped_addresses() {
        assert_eq!(DladdrSymbolicator.resolve(0), None);
        assert_eq!(DladdrSymbolicator.resolve(8), None);
    }

    #[test]
    fn long_names_are_cut_and_flagged() {
        let short = InlineName::new(c"demo_fn");
        assert_eq!(short.as_bytes(), b"demo_fn");
        assert!(!short.is_truncated());
        assert_eq!(short.to_string_lossy(), "demo_fn");
        assert!(InlineName::new(c"").is_empty());

        let long = std::ffi::CString::new(vec![b'x'; NAME_CAPACITY + 40])
            .expect("no interior NUL");
        let cut = InlineName::new(&long);
        assert_eq!(cut.as_bytes().len(), NAME_CAPACITY);
        assert!(cut.is_truncated());
        assert_ne!(cut, InlineName::new(c"x"));
    }

    #[cfg(unix)]
    #[test]
    fn resolved_names_live_inside_the_symbol() {
        let symbol = DladdrSymbolicator
            .resolve(libc::getpid as usize)
            .expect("libc should be a loaded image");
        let name = symbol
            .image_name
            .as_ref()
            .expect("libc image should have a path");
        let start = &symbol as *const Symbol as usize;
        let bytes = name.as_bytes().as_ptr() as usize;
        assert!(bytes >= start && bytes < start + size_of::<Symbol>());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn names_outlive_an_unloaded_library() {
        let candidates: [(&CStr, &CStr); 3] = [
            (c"libbz2.so.1", c"BZ2_bzlibVersion"),
            (c"libz.so.1", c"zlibVersion"),
            (c"libm.so.6", c"cos"),
        ];
        let Some((handle, wanted, symbol)) = candidates.iter().find_map(|(library, wanted)| {
            let flags = libc::RTLD_NOW | libc::RTLD_LOCAL;
            let handle = unsafe { libc::dlopen(library.as_ptr(), flags) };
            if handle.is_null() {
                return None;
            }
            let address = unsafe { libc::dlsym(handle, wanted.as_ptr()) } as usize;
            match DladdrSymbolicator.resolve(address) {
                Some(symbol) if address != 0 => Some((handle, *wanted, symbol)),
                _ => {
                    unsafe { libc::dlclose(handle) };
                    None
                }
            }
        }) else {
            // None of the libraries is installed here.
            return;
        };
        unsafe { libc::dlclose(handle) };

        let name = symbol.symbol_name.expect("exported symbol should be named");
        assert_eq!(name.as_bytes(), wanted.to_bytes());
        assert!(symbol.image_name.is_some_and(|image| !image.is_empty()));
    }
}
