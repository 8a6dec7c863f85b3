//! Image assembly.
//!
//! The final artifact is a single byte sequence: a 40-byte header of five
//! little-endian 64-bit segment offsets (constants, globals, templates,
//! object keys, code) followed by each segment's bytes in that order. The
//! code segment begins with the main-call prologue, so the VM starts
//! executing at the code offset the header points at.

use crate::result::CodegenResult;
use crate::writer::ByteWriter;
use std::path::Path;

/// Size of the segment-offset header.
pub const HEADER_SIZE: u64 = 40;

/// A loadable bytecode image plus its rendered source map.
#[derive(Debug)]
pub struct Image {
    /// The image bytes.
    pub bytes: Vec<u8>,
    /// The source map text: one line per instruction position.
    pub source_map: String,
}

impl Image {
    /// The five segment offsets from the header.
    pub fn segment_offsets(&self) -> [u64; 5] {
        let mut offsets = [0u64; 5];
        for (i, offset) in offsets.iter_mut().enumerate() {
            let start = i * 8;
            *offset = u64::from_le_bytes(self.bytes[start..start + 8].try_into().unwrap());
        }
        offsets
    }

    /// The code segment's bytes.
    pub fn code(&self) -> &[u8] {
        &self.bytes[self.segment_offsets()[4] as usize..]
    }

    /// Write the image to `path`.
    pub fn write_to(&self, path: &Path) -> CodegenResult<()> {
        std::fs::write(path, &self.bytes)?;
        Ok(())
    }

    /// Write the source map next to the image, as `<path>.map`.
    pub fn write_source_map(&self, image_path: &Path) -> CodegenResult<()> {
        let mut path = image_path.as_os_str().to_owned();
        path.push(".map");
        std::fs::write(path, &self.source_map)?;
        Ok(())
    }
}

/// Concatenate the five segments behind the offset header.
pub fn assemble(
    constants: &[u8],
    globals: &[u8],
    templates: &[u8],
    object_keys: &[u8],
    code: &[u8],
    source_map: String,
) -> Image {
    let mut writer = ByteWriter::new();
    let offset_constants = HEADER_SIZE;
    let offset_globals = offset_constants + constants.len() as u64;
    let offset_templates = offset_globals + globals.len() as u64;
    let offset_object_keys = offset_templates + templates.len() as u64;
    let offset_code = offset_object_keys + object_keys.len() as u64;
    writer.u64(offset_constants);
    writer.u64(offset_globals);
    writer.u64(offset_templates);
    writer.u64(offset_object_keys);
    writer.u64(offset_code);
    writer.bytes(constants);
    writer.bytes(globals);
    writer.bytes(templates);
    writer.bytes(object_keys);
    writer.bytes(code);
    Image {
        bytes: writer.into_vec(),
        source_map,
    }
}
