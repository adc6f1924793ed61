//! Lightweight GGUF file reader (v2 and v3).
//!
//! Parses the GGUF header, the metadata key-value index, and the tensor index
//! to provide random access to tensor data. Uses `Read + Seek` generics so the
//! same code works with `BufReader<File>` and `Cursor<&[u8]>`.

use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use crate::device::host;
use crate::error::{DequantError, Result};
use crate::quant::GgmlType;
use crate::tensor::HostTensor;

const GGUF_MAGIC: u32 = 0x46554747; // "GGUF" as little-endian u32
const DEFAULT_ALIGNMENT: u64 = 32;
const ALIGNMENT_KEY: &str = "general.alignment";

/// Attach a description to an I/O failure while parsing.
trait ParseContext<T> {
    fn with_context(self, what: impl FnOnce() -> String) -> Result<T>;
}

impl<T> ParseContext<T> for io::Result<T> {
    fn with_context(self, what: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| DequantError::format(format!("{}: {e}", what())))
    }
}

/// GGUF metadata value type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgufValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    String,
    Array,
    U64,
    I64,
    F64,
}

impl GgufValueType {
    fn from_u32(v: u32) -> Result<Self> {
        Ok(match v {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::F32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::U64,
            11 => Self::I64,
            12 => Self::F64,
            other => {
                return Err(DequantError::format(format!(
                    "unknown GGUF metadata value type: {other}"
                )))
            }
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::Bool => "bool",
            Self::String => "str",
            Self::Array => "arr",
            Self::U64 => "u64",
            Self::I64 => "i64",
            Self::F64 => "f64",
        }
    }

    /// Encoded size of fixed-width scalars.
    fn scalar_size(self) -> Option<i64> {
        match self {
            Self::U8 | Self::I8 | Self::Bool => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 => Some(4),
            Self::U64 | Self::I64 | Self::F64 => Some(8),
            Self::String | Self::Array => None,
        }
    }
}

/// Metadata for a single tensor in a GGUF file.
#[derive(Debug, Clone)]
pub struct GgufTensorInfo {
    pub name: String,
    dimensions: Vec<u64>,
    ggml_type: GgmlType,
    /// Byte offset relative to the start of the data section.
    offset: u64,
}

impl GgufTensorInfo {
    /// Tensor shape, innermost dimension first.
    pub fn shape(&self) -> &[u64] {
        &self.dimensions
    }

    pub fn ggml_type(&self) -> GgmlType {
        self.ggml_type
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Element count, `None` if the dimensions overflow.
    pub fn num_elements(&self) -> Option<u64> {
        self.dimensions.iter().try_fold(1u64, |n, &d| n.checked_mul(d))
    }

    /// Total byte size of the tensor data.
    ///
    /// `None` for a type without a known block size, a partial trailing
    /// block, or a size that overflows.
    pub fn byte_size(&self) -> Option<u64> {
        let elems = self.num_elements()?;
        let block_elems = self.ggml_type.block_elems()? as u64;
        if elems % block_elems != 0 {
            return None;
        }
        (elems / block_elems).checked_mul(self.ggml_type.block_bytes()? as u64)
    }
}

/// A reader for GGUF v2/v3 files.
///
/// Parses the header and indexes on construction, then reads individual
/// tensors on demand via [`read_tensor`](Self::read_tensor).
pub struct GgufReader<R: Read + Seek> {
    reader: R,
    version: u32,
    alignment: u64,
    metadata: Vec<(String, GgufValueType)>,
    /// Tensor names in file order.
    order: Vec<String>,
    tensors: HashMap<String, GgufTensorInfo>,
    data_section_offset: u64,
    /// Total length of the underlying stream.
    stream_len: u64,
}

impl GgufReader<Cursor<&[u8]>> {
    /// Open a GGUF file from an in-memory byte slice.
    pub fn from_bytes(data: &[u8]) -> Result<GgufReader<Cursor<&[u8]>>> {
        GgufReader::open(Cursor::new(data))
    }
}

impl GgufReader<BufReader<File>> {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        GgufReader::open(BufReader::new(File::open(path)?))
    }
}

impl<R: Read + Seek> GgufReader<R> {
    /// Parse the header and both indexes from `reader`.
    pub fn open(mut reader: R) -> Result<Self> {
        let magic = reader
            .read_u32::<LittleEndian>()
            .with_context(|| "failed to read GGUF magic".into())?;
        if magic != GGUF_MAGIC {
            return Err(DequantError::format(format!(
                "invalid GGUF magic: 0x{magic:08X} (expected 0x{GGUF_MAGIC:08X})"
            )));
        }

        let version = reader
            .read_u32::<LittleEndian>()
            .with_context(|| "failed to read GGUF version".into())?;
        if version != 2 && version != 3 {
            return Err(DequantError::format(format!(
                "unsupported GGUF version: {version} (expected 2 or 3)"
            )));
        }

        let tensor_count = reader
            .read_u64::<LittleEndian>()
            .with_context(|| "failed to read tensor count".into())?;
        let metadata_kv_count = reader
            .read_u64::<LittleEndian>()
            .with_context(|| "failed to read metadata KV count".into())?;

        // Metadata values are skipped, except the data alignment.
        let mut alignment = DEFAULT_ALIGNMENT;
        let mut metadata = Vec::new();
        for i in 0..metadata_kv_count {
            let key = read_gguf_string(&mut reader)
                .map_err(|e| DequantError::format(format!("metadata key {i}: {e}")))?;
            let value_type = GgufValueType::from_u32(
                reader
                    .read_u32::<LittleEndian>()
                    .with_context(|| format!("failed to read type of metadata `{key}`"))?,
            )?;
            if key == ALIGNMENT_KEY && value_type == GgufValueType::U32 {
                alignment = u64::from(
                    reader
                        .read_u32::<LittleEndian>()
                        .with_context(|| "failed to read alignment".into())?,
                );
                if alignment == 0 || !alignment.is_power_of_two() {
                    return Err(DequantError::format(format!("invalid alignment {alignment}")));
                }
            } else {
                skip_gguf_value(&mut reader, value_type)
                    .map_err(|e| DequantError::format(format!("metadata `{key}`: {e}")))?;
            }
            metadata.push((key, value_type));
        }

        let mut order = Vec::new();
        let mut tensors = HashMap::new();
        for i in 0..tensor_count {
            let name = read_gguf_string(&mut reader)
                .map_err(|e| DequantError::format(format!("tensor name {i}: {e}")))?;
            let ndims = reader
                .read_u32::<LittleEndian>()
                .with_context(|| format!("failed to read ndims of `{name}`"))?;
            let mut dimensions = Vec::new();
            for d in 0..ndims {
                dimensions.push(
                    reader
                        .read_u64::<LittleEndian>()
                        .with_context(|| format!("failed to read dim {d} of `{name}`"))?,
                );
            }
            let ggml_type = GgmlType::from_code(
                reader
                    .read_u32::<LittleEndian>()
                    .with_context(|| format!("failed to read dtype of `{name}`"))?,
            );
            let offset = reader
                .read_u64::<LittleEndian>()
                .with_context(|| format!("failed to read offset of `{name}`"))?;

            order.push(name.clone());
            tensors.insert(
                name.clone(),
                GgufTensorInfo {
                    name,
                    dimensions,
                    ggml_type,
                    offset,
                },
            );
        }

        let current_pos = reader.stream_position()?;
        let data_section_offset = align_up(current_pos, alignment);
        let stream_len = reader.seek(SeekFrom::End(0))?;

        Ok(Self {
            reader,
            version,
            alignment,
            metadata,
            order,
            tensors,
            data_section_offset,
            stream_len,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Absolute file offset of the tensor data section.
    pub fn data_offset(&self) -> u64 {
        self.data_section_offset
    }

    /// Metadata keys and their value types, in file order.
    pub fn metadata(&self) -> &[(String, GgufValueType)] {
        &self.metadata
    }

    pub fn tensor_count(&self) -> usize {
        self.order.len()
    }

    pub fn tensor_info(&self, name: &str) -> Option<&GgufTensorInfo> {
        self.tensors.get(name)
    }

    /// Tensor names in file order.
    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Read raw tensor bytes from the file.
    ///
    /// # Errors
    ///
    /// `UnsupportedFormat` when the tensor's type has no known block size,
    /// `Format` when its extent overflows or runs past the end of the file.
    pub fn tensor_data(&mut self, name: &str) -> Result<Vec<u8>> {
        let info = self
            .tensors
            .get(name)
            .ok_or_else(|| DequantError::format(format!("tensor `{name}` not found in GGUF")))?;
        if info.ggml_type.block_elems().is_none() {
            return Err(DequantError::UnsupportedFormat {
                ggml_type: info.ggml_type,
            });
        }
        let byte_size = info
            .byte_size()
            .ok_or_else(|| DequantError::format(format!("tensor `{name}` has an invalid shape {:?}", info.dimensions)))?;
        let abs_offset = self.data_section_offset.checked_add(info.offset);
        let in_bounds = abs_offset
            .and_then(|start| start.checked_add(byte_size))
            .is_some_and(|end| end <= self.stream_len);
        let Some(abs_offset) = abs_offset.filter(|_| in_bounds) else {
            return Err(DequantError::format(format!(
                "tensor `{name}` ({byte_size} bytes at data offset {}) extends past the end of the file ({} bytes)",
                info.offset, self.stream_len
            )));
        };
        let byte_size = usize::try_from(byte_size)
            .map_err(|_| DequantError::format(format!("tensor `{name}` is too large")))?;

        self.reader.seek(SeekFrom::Start(abs_offset))?;
        let mut buf = host::zeroed(byte_size)?;
        self.reader
            .read_exact(&mut buf)
            .with_context(|| format!("tensor `{name}` data is truncated"))?;
        Ok(buf)
    }

    /// Read a tensor as a [`HostTensor`] ready for upload.
    pub fn read_tensor(&mut self, name: &str) -> Result<HostTensor> {
        let data = self.tensor_data(name)?;
        let info = &self.tensors[name];
        let dims = info
            .dimensions
            .iter()
            .map(|&d| usize::try_from(d))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| DequantError::format(format!("tensor `{name}` has an oversized dimension")))?;
        HostTensor::new(name, info.ggml_type, dims, data)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_gguf_string<R: Read>(reader: &mut R) -> io::Result<String> {
    let len = reader.read_u64::<LittleEndian>()?;
    let mut buf = Vec::new();
    reader.by_ref().take(len).read_to_end(&mut buf)?;
    if buf.len() as u64 != len {
        return Err(io::ErrorKind::UnexpectedEof.into());
    }
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn skip_gguf_value<R: Read + Seek>(reader: &mut R, value_type: GgufValueType) -> Result<()> {
    if let Some(size) = value_type.scalar_size() {
        reader.seek(SeekFrom::Current(size))?;
        return Ok(());
    }
    match value_type {
        GgufValueType::String => {
            read_gguf_string(reader)?;
        }
        GgufValueType::Array => {
            let elem_type = GgufValueType::from_u32(reader.read_u32::<LittleEndian>()?)?;
            let count = reader.read_u64::<LittleEndian>()?;
            match elem_type.scalar_size() {
                Some(size) => {
                    let bytes = i64::try_from(count)
                        .ok()
                        .and_then(|c| c.checked_mul(size))
                        .ok_or_else(|| DequantError::format("array length overflows"))?;
                    reader.seek(SeekFrom::Current(bytes))?;
                }
                None => {
                    for _ in 0..count {
                        skip_gguf_value(reader, elem_type)?;
                    }
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn align_up(offset: u64, alignment: u64) -> u64 {
    offset.div_ceil(alignment) * alignment
}
