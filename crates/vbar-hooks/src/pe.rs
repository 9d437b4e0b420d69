//! Export directories of PE images.
//!
//! Works on the *mapped* layout of an image (offsets are RVAs), which is
//! what a loaded module looks like in memory. Nothing here touches the
//! operating system, so the parser is tested on synthetic images on every
//! platform.

use crate::{HookError, HookResult};

const DOS_MAGIC: &[u8; 2] = b"MZ";
const NT_SIGNATURE: &[u8; 4] = b"PE\0\0";
const E_LFANEW: usize = 0x3C;
const FILE_HEADER_LEN: usize = 20;
const PE32_MAGIC: u16 = 0x10B;
const PE32_PLUS_MAGIC: u16 = 0x20B;
const EXPORT_DIRECTORY_LEN: usize = 40;

/// An RVA range from the optional header's data directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataDirectory {
    /// Start RVA.
    pub rva: u32,
    /// Length in bytes.
    pub size: u32,
}

impl DataDirectory {
    const fn contains(&self, rva: u32) -> bool {
        rva >= self.rva && (rva - self.rva) < self.size
    }
}

/// One exported function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Export {
    /// Exported name.
    pub name: String,
    /// Ordinal including the directory's base.
    pub ordinal: u32,
    /// RVA of the function (or of the forwarder string).
    pub rva: u32,
    /// RVA of the 32-bit slot in the export address table holding `rva`.
    pub slot_rva: u32,
    /// `"DLL.Symbol"` if the export is forwarded to another module.
    pub forwarder: Option<String>,
}

/// A validated view of a mapped PE image.
#[derive(Debug)]
pub struct PeImage<'a> {
    bytes: &'a [u8],
    size_of_image: u32,
    exports: Option<DataDirectory>,
}

impl<'a> PeImage<'a> {
    /// Validate the headers of a mapped image.
    ///
    /// `bytes` may be shorter than the image as long as it covers the
    /// headers; reading exports then needs the full image.
    ///
    /// # Errors
    ///
    /// Returns [`HookError::MalformedImage`] if a header is missing or
    /// truncated.
    pub fn parse(bytes: &'a [u8]) -> HookResult<Self> {
        let mut image = Self {
            bytes,
            size_of_image: 0,
            exports: None,
        };
        if bytes.get(..2) != Some(DOS_MAGIC.as_slice()) {
            return Err(malformed("missing MZ signature"));
        }
        let nt = image.u32_at(E_LFANEW)? as usize;
        if bytes.get(nt..nt + 4) != Some(NT_SIGNATURE.as_slice()) {
            return Err(malformed("missing PE signature"));
        }
        let optional = nt + 4 + FILE_HEADER_LEN;
        let (count_at, dirs_at) = match image.u16_at(optional)? {
            PE32_MAGIC => (optional + 92, optional + 96),
            PE32_PLUS_MAGIC => (optional + 108, optional + 112),
            other => return Err(malformed(&format!("unknown optional header magic {other:#x}"))),
        };
        image.size_of_image = image.u32_at(optional + 56)?;
        if image.u32_at(count_at)? > 0 {
            let dir = DataDirectory {
                rva: image.u32_at(dirs_at)?,
                size: image.u32_at(dirs_at + 4)?,
            };
            if dir.rva != 0 && dir.size != 0 {
                image.exports = Some(dir);
            }
        }
        Ok(image)
    }

    /// `SizeOfImage` from the optional header.
    #[must_use]
    pub const fn size_of_image(&self) -> u32 {
        self.size_of_image
    }

    /// The export data directory, if the image exports anything.
    #[must_use]
    pub const fn export_directory(&self) -> Option<DataDirectory> {
        self.exports
    }

    /// All named exports, in name-table order.
    ///
    /// # Errors
    ///
    /// Returns [`HookError::MalformedImage`] if a table runs past the image.
    pub fn exports(&self) -> HookResult<Vec<Export>> {
        let Some(dir) = self.exports else {
            return Ok(Vec::new());
        };
        let at = dir.rva as usize;
        if at + EXPORT_DIRECTORY_LEN > self.bytes.len() {
            return Err(malformed("export directory outside the image"));
        }
        let base = self.u32_at(at + 16)?;
        let function_count = self.u32_at(at + 20)?;
        let name_count = self.u32_at(at + 24)? as usize;
        let functions = self.u32_at(at + 28)?;
        let names = self.u32_at(at + 32)? as usize;
        let ordinals = self.u32_at(at + 36)? as usize;

        let mut out = Vec::with_capacity(name_count);
        for i in 0..name_count {
            let name = self.c_str_at(self.u32_at(names + 4 * i)? as usize)?;
            let index = u32::from(self.u16_at(ordinals + 2 * i)?);
            if index >= function_count {
                return Err(malformed(&format!("{name} has ordinal index {index} past the table")));
            }
            let slot_rva = functions
                .checked_add(4 * index)
                .ok_or_else(|| malformed("export address table wraps the address space"))?;
            let rva = self.u32_at(slot_rva as usize)?;
            let forwarder = if dir.contains(rva) {
                Some(self.c_str_at(rva as usize)?.to_string())
            } else {
                None
            };
            out.push(Export {
                name: name.to_string(),
                ordinal: base.wrapping_add(index),
                rva,
                slot_rva,
                forwarder,
            });
        }
        Ok(out)
    }

    /// The export called `name`.
    ///
    /// # Errors
    ///
    /// See [`exports`](Self::exports).
    pub fn find_export(&self, name: &str) -> HookResult<Option<Export>> {
        Ok(self.exports()?.into_iter().find(|e| e.name == name))
    }

    fn u16_at(&self, offset: usize) -> HookResult<u16> {
        self.bytes
            .get(offset..offset + 2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .ok_or_else(|| malformed(&format!("read of 2 bytes at {offset:#x} past the end")))
    }

    fn u32_at(&self, offset: usize) -> HookResult<u32> {
        self.bytes
            .get(offset..offset + 4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or_else(|| malformed(&format!("read of 4 bytes at {offset:#x} past the end")))
    }

    fn c_str_at(&self, offset: usize) -> HookResult<&'a str> {
        let bytes: &'a [u8] = self.bytes;
        let tail = bytes
            .get(offset..)
            .ok_or_else(|| malformed(&format!("string at {offset:#x} outside the image")))?;
        let len = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| malformed("unterminated string"))?;
        std::str::from_utf8(&tail[..len]).map_err(|_| malformed("non-UTF-8 export name"))
    }
}

fn malformed(msg: &str) -> HookError {
    HookError::MalformedImage(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const NT: usize = 0x80;
    const EXPORTS: usize = 0x1000;
    const EXPORTS_LEN: usize = 0x400;

    fn put_u16(buf: &mut [u8], at: usize, v: u16) {
        buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], at: usize, v: u32) {
        buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    fn put_str(buf: &mut [u8], at: usize, s: &str) {
        buf[at..at + s.len()].copy_from_slice(s.as_bytes());
        buf[at + s.len()] = 0;
    }

    /// A mapped image exporting `exports` as `(name, rva)`; an rva of 0
    /// marks a forwarder to `KERNEL32.HeapAlloc`.
    fn image(plus: bool, exports: &[(&str, u32)]) -> Vec<u8> {
        let mut buf = vec![0u8; 0x2000];
        buf[..2].copy_from_slice(b"MZ");
        put_u32(&mut buf, E_LFANEW, NT as u32);
        buf[NT..NT + 4].copy_from_slice(b"PE\0\0");
        let opt = NT + 4 + FILE_HEADER_LEN;
        put_u16(&mut buf, opt, if plus { PE32_PLUS_MAGIC } else { PE32_MAGIC });
        put_u32(&mut buf, opt + 56, 0x2000);
        let (count_at, dirs_at) = if plus { (opt + 108, opt + 112) } else { (opt + 92, opt + 96) };
        put_u32(&mut buf, count_at, 16);
        put_u32(&mut buf, dirs_at, EXPORTS as u32);
        put_u32(&mut buf, dirs_at + 4, EXPORTS_LEN as u32);

        let n = exports.len() as u32;
        let (functions, names, ordinals) = (EXPORTS + 0x40, EXPORTS + 0x80, EXPORTS + 0xC0);
        put_u32(&mut buf, EXPORTS + 16, 1);
        put_u32(&mut buf, EXPORTS + 20, n);
        put_u32(&mut buf, EXPORTS + 24, n);
        put_u32(&mut buf, EXPORTS + 28, functions as u32);
        put_u32(&mut buf, EXPORTS + 32, names as u32);
        put_u32(&mut buf, EXPORTS + 36, ordinals as u32);

        let mut strings = EXPORTS + 0x100;
        for (i, (name, rva)) in exports.iter().enumerate() {
            put_str(&mut buf, strings, name);
            put_u32(&mut buf, names + 4 * i, strings as u32);
            strings += name.len() + 1;
            put_u16(&mut buf, ordinals + 2 * i, i as u16);
            let target = if *rva == 0 {
                put_str(&mut buf, EXPORTS + 0x300, "KERNEL32.HeapAlloc");
                (EXPORTS + 0x300) as u32
            } else {
                *rva
            };
            put_u32(&mut buf, functions + 4 * i, target);
        }
        buf
    }

    #[test]
    fn test_parse_pe32_plus_exports() {
        let bytes = image(true, &[("cudaFree", 0x1810), ("cudaMalloc", 0x1800)]);
        let pe = PeImage::parse(&bytes).unwrap();
        assert_eq!(pe.size_of_image(), 0x2000);
        let exports = pe.exports().unwrap();
        assert_eq!(exports.len(), 2);

        let malloc = pe.find_export("cudaMalloc").unwrap().unwrap();
        assert_eq!(malloc.rva, 0x1800);
        assert_eq!(malloc.ordinal, 2);
        assert_eq!(malloc.slot_rva, (EXPORTS + 0x44) as u32);
        assert!(malloc.forwarder.is_none());
        assert!(pe.find_export("cudaMallocAsync").unwrap().is_none());
    }

    #[test]
    fn test_parse_pe32_and_forwarders() {
        let bytes = image(false, &[("Alloc", 0)]);
        let pe = PeImage::parse(&bytes).unwrap();
        let alloc = pe.find_export("Alloc").unwrap().unwrap();
        assert_eq!(alloc.forwarder.as_deref(), Some("KERNEL32.HeapAlloc"));
    }

    #[test]
    fn test_rejects_bad_headers() {
        assert!(PeImage::parse(b"ZZ").is_err());
        let mut bytes = image(true, &[]);
        bytes[NT] = b'X';
        assert!(matches!(PeImage::parse(&bytes), Err(HookError::MalformedImage(_))));

        let mut bytes = image(true, &[]);
        put_u16(&mut bytes, NT + 24, 0x999);
        assert!(PeImage::parse(&bytes).is_err());
    }

    #[test]
    fn test_truncated_image() {
        let bytes = image(true, &[("cudaMalloc", 0x1800)]);
        let pe = PeImage::parse(&bytes[..0x400]).unwrap();
        assert!(pe.export_directory().is_some());
        assert!(pe.exports().is_err());
    }

    #[test]
    fn test_image_without_exports() {
        let mut bytes = image(true, &[]);
        put_u32(&mut bytes, NT + 24 + 112, 0);
        let pe = PeImage::parse(&bytes).unwrap();
        assert!(pe.exports().unwrap().is_empty());
    }

    proptest::proptest! {
        #[test]
        fn test_arbitrary_bytes_never_panic(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..4096)) {
            if let Ok(pe) = PeImage::parse(&bytes) {
                let _ = pe.exports();
            }
        }

        #[test]
        fn test_corrupted_export_table_never_panics(at in 0x1000usize..0x1400, value in proptest::num::u8::ANY) {
            let mut bytes = image(true, &[("cudaMalloc", 0x1800), ("cudaFree", 0x1810)]);
            bytes[at] = value;
            let pe = PeImage::parse(&bytes).unwrap();
            let _ = pe.find_export("cudaFree");
        }
    }
}
