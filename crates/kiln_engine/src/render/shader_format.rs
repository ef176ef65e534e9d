//! Shader binary format
//!
//! Shaders ship as a single `.csh` blob containing SPIR-V bytecode for the
//! Vulkan backend, transpiled GLSL source for the OpenGL backend, and a
//! bind table mapping hashed descriptor identities to flat GL binding
//! slots (GL has no descriptor sets). The header is bit-exact and
//! little-endian:
//!
//! ```text
//! offset  size  field
//!      0     3  magic "CSH"
//!      3     1  is_compute flag
//!      4     8  bind-table entry count (u64)
//!     12     8  bind-table byte offset (u64)
//!     20    64  span union: raster = { vert spv, frag spv,
//!                                      vert glsl, frag glsl }
//!                           compute = { spv, glsl, zero, zero }
//! ```
//!
//! Each span is `(offset: u64, size: u64)` into the blob. Bind-table
//! entries are `(hashed id: u64, binding: u32)`, packed to 12 bytes.

use thiserror::Error;

/// Magic bytes at the start of every shader binary
pub const SHADER_MAGIC: [u8; 3] = *b"CSH";

/// Fixed header size in bytes
pub const HEADER_SIZE: usize = 84;

const SPAN_UNION_OFFSET: usize = 20;
const BIND_ENTRY_SIZE: usize = 12;

/// Shader binary format errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShaderFormatError {
    /// Leading magic bytes did not match
    #[error("Bad shader magic (not a CSH binary)")]
    BadMagic,

    /// The blob is smaller than a declared offset requires
    #[error("Truncated shader binary: need {needed} bytes, have {actual}")]
    Truncated {
        /// Bytes the header or a span requires
        needed: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// SPIR-V spans must hold whole 32-bit words
    #[error("SPIR-V span size {0} is not a multiple of 4")]
    MisalignedSpirv(u64),
}

/// `(offset, size)` pair locating one blob inside the binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// Byte offset from the start of the binary
    pub offset: u64,
    /// Byte length
    pub size: u64,
}

impl Span {
    /// Slice the span out of the binary, bounds-checked
    pub fn slice<'a>(&self, bytes: &'a [u8]) -> Result<&'a [u8], ShaderFormatError> {
        let end = self
            .offset
            .checked_add(self.size)
            .ok_or(ShaderFormatError::Truncated {
                needed: usize::MAX,
                actual: bytes.len(),
            })? as usize;
        if end > bytes.len() {
            return Err(ShaderFormatError::Truncated {
                needed: end,
                actual: bytes.len(),
            });
        }
        Ok(&bytes[self.offset as usize..end])
    }

    fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Raster (vertex + fragment) span table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RasterSpans {
    /// Vertex-stage SPIR-V bytecode
    pub vert_spv: Span,
    /// Fragment-stage SPIR-V bytecode
    pub frag_spv: Span,
    /// Vertex-stage GLSL source text
    pub vert_glsl: Span,
    /// Fragment-stage GLSL source text
    pub frag_glsl: Span,
}

/// Compute span table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ComputeSpans {
    /// Compute-stage SPIR-V bytecode
    pub spv: Span,
    /// Compute-stage GLSL source text
    pub glsl: Span,
}

/// Which branch of the header's span union is active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderSpans {
    /// Vertex + fragment shader
    Raster(RasterSpans),
    /// Compute shader
    Compute(ComputeSpans),
}

/// One bind-table entry: hashed descriptor identity → flat GL binding slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindTableEntry {
    /// FNV-1a 64 hash of `"set.binding"` (see
    /// [`crate::render::api::hash_name`])
    pub id: u64,
    /// Flat binding slot for backends without descriptor sets
    pub binding: u32,
}

/// Decoded shader binary header plus bind table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderHeader {
    /// Span union branch
    pub spans: ShaderSpans,
    /// Bind table entries
    pub bind_table: Vec<BindTableEntry>,
}

impl ShaderHeader {
    /// Whether this is a compute shader
    pub fn is_compute(&self) -> bool {
        matches!(self.spans, ShaderSpans::Compute(_))
    }

    /// Look up a flat GL binding slot by hashed id
    pub fn binding_for(&self, id: u64) -> Option<u32> {
        self.bind_table
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.binding)
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

fn read_span(bytes: &[u8], offset: usize) -> Span {
    Span {
        offset: read_u64(bytes, offset),
        size: read_u64(bytes, offset + 8),
    }
}

/// Decode the header and bind table from a shader binary
pub fn decode(bytes: &[u8]) -> Result<ShaderHeader, ShaderFormatError> {
    if bytes.len() < HEADER_SIZE {
        return Err(ShaderFormatError::Truncated {
            needed: HEADER_SIZE,
            actual: bytes.len(),
        });
    }
    if bytes[..3] != SHADER_MAGIC {
        return Err(ShaderFormatError::BadMagic);
    }

    let is_compute = bytes[3] != 0;
    let bind_count = read_u64(bytes, 4) as usize;
    let bind_offset = read_u64(bytes, 12) as usize;

    let spans = if is_compute {
        let spans = ComputeSpans {
            spv: read_span(bytes, SPAN_UNION_OFFSET),
            glsl: read_span(bytes, SPAN_UNION_OFFSET + 16),
        };
        if spans.spv.size % 4 != 0 {
            return Err(ShaderFormatError::MisalignedSpirv(spans.spv.size));
        }
        ShaderSpans::Compute(spans)
    } else {
        let spans = RasterSpans {
            vert_spv: read_span(bytes, SPAN_UNION_OFFSET),
            frag_spv: read_span(bytes, SPAN_UNION_OFFSET + 16),
            vert_glsl: read_span(bytes, SPAN_UNION_OFFSET + 32),
            frag_glsl: read_span(bytes, SPAN_UNION_OFFSET + 48),
        };
        for span in [spans.vert_spv, spans.frag_spv] {
            if span.size % 4 != 0 {
                return Err(ShaderFormatError::MisalignedSpirv(span.size));
            }
        }
        ShaderSpans::Raster(spans)
    };

    // Validate every declared span against the blob up front so backends
    // can slice without re-checking.
    let declared = match spans {
        ShaderSpans::Raster(s) => vec![s.vert_spv, s.frag_spv, s.vert_glsl, s.frag_glsl],
        ShaderSpans::Compute(s) => vec![s.spv, s.glsl],
    };
    for span in declared {
        if !span.is_empty() {
            span.slice(bytes)?;
        }
    }

    let table_end = bind_count
        .checked_mul(BIND_ENTRY_SIZE)
        .and_then(|len| bind_offset.checked_add(len))
        .ok_or(ShaderFormatError::Truncated {
            needed: usize::MAX,
            actual: bytes.len(),
        })?;
    if table_end > bytes.len() {
        return Err(ShaderFormatError::Truncated {
            needed: table_end,
            actual: bytes.len(),
        });
    }

    let mut bind_table = Vec::with_capacity(bind_count);
    for i in 0..bind_count {
        let at = bind_offset + i * BIND_ENTRY_SIZE;
        bind_table.push(BindTableEntry {
            id: read_u64(bytes, at),
            binding: read_u32(bytes, at + 8),
        });
    }

    Ok(ShaderHeader { spans, bind_table })
}

/// Builder assembling a shader binary from its constituent blobs
///
/// Used by tooling and tests; the engine itself only decodes.
#[derive(Default)]
pub struct ShaderBinaryBuilder {
    is_compute: bool,
    blobs: Vec<Vec<u8>>,
    bind_table: Vec<BindTableEntry>,
}

impl ShaderBinaryBuilder {
    /// Start a raster (vertex + fragment) binary; blob order is
    /// vert SPIR-V, frag SPIR-V, vert GLSL, frag GLSL
    pub fn raster(
        vert_spv: Vec<u8>,
        frag_spv: Vec<u8>,
        vert_glsl: Vec<u8>,
        frag_glsl: Vec<u8>,
    ) -> Self {
        Self {
            is_compute: false,
            blobs: vec![vert_spv, frag_spv, vert_glsl, frag_glsl],
            bind_table: Vec::new(),
        }
    }

    /// Start a compute binary
    pub fn compute(spv: Vec<u8>, glsl: Vec<u8>) -> Self {
        Self {
            is_compute: true,
            blobs: vec![spv, glsl],
            bind_table: Vec::new(),
        }
    }

    /// Append a bind-table entry
    pub fn bind(mut self, id: u64, binding: u32) -> Self {
        self.bind_table.push(BindTableEntry { id, binding });
        self
    }

    /// Serialize to the wire format
    pub fn build(self) -> Vec<u8> {
        let mut spans = [Span::default(); 4];
        let mut cursor = HEADER_SIZE as u64;
        for (i, blob) in self.blobs.iter().enumerate() {
            spans[i] = Span {
                offset: cursor,
                size: blob.len() as u64,
            };
            cursor += blob.len() as u64;
        }
        let bind_offset = cursor;

        let mut out = Vec::with_capacity(
            HEADER_SIZE
                + self.blobs.iter().map(Vec::len).sum::<usize>()
                + self.bind_table.len() * BIND_ENTRY_SIZE,
        );
        out.extend_from_slice(&SHADER_MAGIC);
        out.push(u8::from(self.is_compute));
        out.extend_from_slice(&(self.bind_table.len() as u64).to_le_bytes());
        out.extend_from_slice(&bind_offset.to_le_bytes());
        for span in spans {
            out.extend_from_slice(&span.offset.to_le_bytes());
            out.extend_from_slice(&span.size.to_le_bytes());
        }
        debug_assert_eq!(out.len(), HEADER_SIZE);

        for blob in &self.blobs {
            out.extend_from_slice(blob);
        }
        for entry in &self.bind_table {
            out.extend_from_slice(&entry.id.to_le_bytes());
            out.extend_from_slice(&entry.binding.to_le_bytes());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::hash_name;

    fn fake_spirv(words: usize) -> Vec<u8> {
        (0..words)
            .flat_map(|w| (w as u32).to_le_bytes())
            .collect()
    }

    #[test]
    fn test_raster_round_trip() {
        let bytes = ShaderBinaryBuilder::raster(
            fake_spirv(5),
            fake_spirv(9),
            b"void main() { /* vert */ }".to_vec(),
            b"void main() { /* frag */ }".to_vec(),
        )
        .bind(hash_name("frame.camera"), 0)
        .bind(hash_name("material.albedo"), 1)
        .build();

        let header = decode(&bytes).unwrap();
        assert!(!header.is_compute());
        let spans = match header.spans {
            ShaderSpans::Raster(s) => s,
            ShaderSpans::Compute(_) => panic!("wrong union branch"),
        };
        assert_eq!(spans.vert_spv.size, 20);
        assert_eq!(spans.frag_spv.size, 36);
        assert_eq!(spans.vert_spv.slice(&bytes).unwrap(), fake_spirv(5));
        assert_eq!(
            spans.frag_glsl.slice(&bytes).unwrap(),
            b"void main() { /* frag */ }"
        );
        assert_eq!(header.bind_table.len(), 2);
        assert_eq!(header.binding_for(hash_name("material.albedo")), Some(1));
        assert_eq!(header.binding_for(hash_name("missing")), None);
    }

    #[test]
    fn test_compute_round_trip() {
        let bytes = ShaderBinaryBuilder::compute(fake_spirv(7), b"/* comp */".to_vec()).build();
        let header = decode(&bytes).unwrap();
        assert!(header.is_compute());
        let spans = match header.spans {
            ShaderSpans::Compute(s) => s,
            ShaderSpans::Raster(_) => panic!("wrong union branch"),
        };
        assert_eq!(spans.spv.slice(&bytes).unwrap(), fake_spirv(7));
        assert_eq!(spans.glsl.slice(&bytes).unwrap(), b"/* comp */");
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = ShaderBinaryBuilder::compute(fake_spirv(1), Vec::new()).build();
        bytes[0] = b'X';
        assert_eq!(decode(&bytes), Err(ShaderFormatError::BadMagic));
    }

    #[test]
    fn test_truncated_header() {
        let err = decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, ShaderFormatError::Truncated { .. }));
    }

    #[test]
    fn test_truncated_span() {
        let mut bytes = ShaderBinaryBuilder::compute(fake_spirv(4), Vec::new()).build();
        bytes.truncate(HEADER_SIZE + 4);
        assert!(matches!(
            decode(&bytes),
            Err(ShaderFormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_bind_table_offset_overflow() {
        // A bind offset near usize::MAX must not wrap past the bounds
        // check; it is just another form of truncation.
        let mut bytes = ShaderBinaryBuilder::compute(fake_spirv(1), Vec::new()).build();
        bytes[4..12].copy_from_slice(&2u64.to_le_bytes());
        bytes[12..20].copy_from_slice(&(u64::MAX - 10).to_le_bytes());
        assert!(matches!(
            decode(&bytes),
            Err(ShaderFormatError::Truncated { .. })
        ));
    }

    #[test]
    fn test_misaligned_spirv() {
        let bytes = ShaderBinaryBuilder::compute(vec![1, 2, 3], Vec::new()).build();
        assert_eq!(decode(&bytes), Err(ShaderFormatError::MisalignedSpirv(3)));
    }

    #[test]
    fn test_header_size_fixed_across_kinds() {
        // The span union is padded to the raster branch, so the header is
        // the same size whichever branch is active.
        let raster =
            ShaderBinaryBuilder::raster(fake_spirv(1), fake_spirv(1), vec![], vec![]).build();
        let compute = ShaderBinaryBuilder::compute(fake_spirv(1), vec![]).build();
        let raster_first_span = match decode(&raster).unwrap().spans {
            ShaderSpans::Raster(s) => s.vert_spv.offset,
            ShaderSpans::Compute(_) => unreachable!(),
        };
        let compute_first_span = match decode(&compute).unwrap().spans {
            ShaderSpans::Compute(s) => s.spv.offset,
            ShaderSpans::Raster(_) => unreachable!(),
        };
        assert_eq!(raster_first_span, HEADER_SIZE as u64);
        assert_eq!(compute_first_span, HEADER_SIZE as u64);
    }
}
