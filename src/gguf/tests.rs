//! Unit tests for GGUF parsing and whole-file upload.

#[cfg(test)]
mod tests {
    use std::io::Write;

    use crate::device::{dequantize, DeviceContext, DispatchConfig};
    use crate::error::DequantError;
    use crate::gguf::*;
    use crate::quant::{
        dequantize_row_q4_0, f32_to_bytes, quantize_row_q4_0, quantize_row_q6_k, GgmlType,
    };
    use crate::tensor::TensorSource;

    const GGUF_TYPE_U32: u32 = 4;
    const GGUF_TYPE_STRING: u32 = 8;
    const GGUF_TYPE_ARRAY: u32 = 9;

    // =========================================================================
    // GGUF builders (test-only)
    // =========================================================================

    struct TensorDef<'a> {
        name: &'a str,
        shape: &'a [u64],
        ggml_type: GgmlType,
        data: &'a [u8],
    }

    fn write_gguf_string(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    /// Build a GGUF v3 file. `alignment` is written as `general.alignment`
    /// when it differs from the default of 32.
    fn build_gguf(tensors: &[TensorDef<'_>], alignment: usize) -> Vec<u8> {
        let mut buf = Vec::new();

        // Header
        buf.extend_from_slice(&0x46554747u32.to_le_bytes()); // magic "GGUF"
        buf.extend_from_slice(&3u32.to_le_bytes()); // version
        buf.extend_from_slice(&(tensors.len() as u64).to_le_bytes());
        let kv_count: u64 = if alignment == 32 { 2 } else { 3 };
        buf.extend_from_slice(&kv_count.to_le_bytes());

        // Metadata KV
        write_gguf_string(&mut buf, "general.architecture");
        buf.extend_from_slice(&GGUF_TYPE_STRING.to_le_bytes());
        write_gguf_string(&mut buf, "llama");

        write_gguf_string(&mut buf, "tokenizer.ggml.tokens");
        buf.extend_from_slice(&GGUF_TYPE_ARRAY.to_le_bytes());
        buf.extend_from_slice(&GGUF_TYPE_STRING.to_le_bytes());
        buf.extend_from_slice(&3u64.to_le_bytes());
        for token in ["<s>", "</s>", "hello"] {
            write_gguf_string(&mut buf, token);
        }

        if alignment != 32 {
            write_gguf_string(&mut buf, "general.alignment");
            buf.extend_from_slice(&GGUF_TYPE_U32.to_le_bytes());
            buf.extend_from_slice(&(alignment as u32).to_le_bytes());
        }

        // Tensor infos, each tensor's data aligned within the data section
        let mut offsets = Vec::new();
        let mut data_offset = 0usize;
        for t in tensors {
            write_gguf_string(&mut buf, t.name);
            buf.extend_from_slice(&(t.shape.len() as u32).to_le_bytes());
            for &dim in t.shape {
                buf.extend_from_slice(&dim.to_le_bytes());
            }
            buf.extend_from_slice(&t.ggml_type.code().to_le_bytes());
            buf.extend_from_slice(&(data_offset as u64).to_le_bytes());
            offsets.push(data_offset);
            data_offset = (data_offset + t.data.len()).next_multiple_of(alignment);
        }

        // Data section
        buf.resize(buf.len().next_multiple_of(alignment), 0);
        let start = buf.len();
        for (t, offset) in tensors.iter().zip(offsets) {
            buf.resize(start + offset, 0);
            buf.extend_from_slice(t.data);
        }
        buf
    }

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32 / 100.0 - 1.0).collect()
    }

    // =========================================================================
    // Reader
    // =========================================================================

    #[test]
    fn test_gguf_reader_parse_header() {
        let q4 = quantize_row_q4_0(&ramp(64)).unwrap();
        let file = build_gguf(
            &[TensorDef {
                name: "blk.0.attn_q.weight",
                shape: &[32, 2],
                ggml_type: GgmlType::Q4_0,
                data: &q4,
            }],
            32,
        );

        let reader = GgufReader::from_bytes(&file).unwrap();
        assert_eq!(reader.version(), 3);
        assert_eq!(reader.alignment(), 32);
        assert_eq!(reader.tensor_count(), 1);
        assert_eq!(reader.data_offset() % 32, 0);

        let keys: Vec<_> = reader.metadata().iter().map(|(k, t)| (k.as_str(), t.name())).collect();
        assert_eq!(
            keys,
            [("general.architecture", "str"), ("tokenizer.ggml.tokens", "arr")]
        );

        let info = reader.tensor_info("blk.0.attn_q.weight").unwrap();
        assert_eq!(info.shape(), &[32, 2]);
        assert_eq!(info.ggml_type(), GgmlType::Q4_0);
        assert_eq!(info.offset(), 0);
        assert_eq!(info.num_elements(), Some(64));
        assert_eq!(info.byte_size(), Some(36));
    }

    #[test]
    fn test_gguf_multiple_tensors_in_file_order() {
        let q4 = quantize_row_q4_0(&ramp(128)).unwrap();
        let q6 = quantize_row_q6_k(&ramp(256)).unwrap();
        let f32s = f32_to_bytes(&ramp(5));
        let file = build_gguf(
            &[
                TensorDef { name: "z.q4", shape: &[128], ggml_type: GgmlType::Q4_0, data: &q4 },
                TensorDef { name: "a.f32", shape: &[5], ggml_type: GgmlType::F32, data: &f32s },
                TensorDef { name: "m.q6", shape: &[256], ggml_type: GgmlType::Q6_K, data: &q6 },
            ],
            64,
        );

        let mut reader = GgufReader::from_bytes(&file).unwrap();
        assert_eq!(reader.alignment(), 64);
        let names: Vec<_> = reader.tensor_names().collect();
        assert_eq!(names, ["z.q4", "a.f32", "m.q6"]);

        assert_eq!(reader.tensor_data("z.q4").unwrap(), q4);
        assert_eq!(reader.tensor_data("m.q6").unwrap(), q6);

        let t = reader.read_tensor("a.f32").unwrap();
        assert_eq!(t.ggml_type(), GgmlType::F32);
        assert_eq!(t.dims(), &[5]);
        assert_eq!(t.data(), &f32s[..]);

        assert!(matches!(
            reader.tensor_data("missing"),
            Err(DequantError::Format { .. })
        ));
    }

    #[test]
    fn test_gguf_rejects_bad_headers() {
        let mut file = build_gguf(&[], 32);
        file[0] = b'X';
        assert!(matches!(
            GgufReader::from_bytes(&file),
            Err(DequantError::Format { .. })
        ));

        let mut file = build_gguf(&[], 32);
        file[4..8].copy_from_slice(&1u32.to_le_bytes());
        assert!(matches!(
            GgufReader::from_bytes(&file),
            Err(DequantError::Format { .. })
        ));

        assert!(GgufReader::from_bytes(&[0x47, 0x47]).is_err());
    }

    #[test]
    fn test_gguf_truncated_tensor_data() {
        let q4 = quantize_row_q4_0(&ramp(64)).unwrap();
        let mut file = build_gguf(
            &[TensorDef { name: "w", shape: &[64], ggml_type: GgmlType::Q4_0, data: &q4 }],
            32,
        );
        file.truncate(file.len() - 10);
        let mut reader = GgufReader::from_bytes(&file).unwrap();
        assert!(matches!(reader.read_tensor("w"), Err(DequantError::Format { .. })));
    }

    #[test]
    fn test_gguf_unknown_dtype_is_indexed() {
        let q4 = quantize_row_q4_0(&ramp(32)).unwrap();
        let bf16 = vec![0u8; 2 * 8];
        let iq = vec![0u8; 66];
        let file = build_gguf(
            &[
                TensorDef { name: "bf16", shape: &[8], ggml_type: GgmlType::from_code(30), data: &bf16 },
                TensorDef { name: "iq2", shape: &[256], ggml_type: GgmlType::from_code(16), data: &iq },
                TensorDef { name: "w", shape: &[32], ggml_type: GgmlType::Q4_0, data: &q4 },
            ],
            32,
        );

        let mut reader = GgufReader::from_bytes(&file).unwrap();
        assert_eq!(reader.tensor_count(), 3);
        assert_eq!(reader.tensor_info("bf16").unwrap().ggml_type(), GgmlType::BF16);
        assert_eq!(reader.tensor_info("bf16").unwrap().byte_size(), Some(16));
        let iq_info = reader.tensor_info("iq2").unwrap();
        assert_eq!(iq_info.ggml_type(), GgmlType::Unknown(16));
        assert_eq!(iq_info.byte_size(), None);

        assert_eq!(reader.tensor_data("bf16").unwrap(), bf16);
        assert!(matches!(
            reader.read_tensor("iq2"),
            Err(DequantError::UnsupportedFormat { ggml_type: GgmlType::Unknown(16) })
        ));

        let ctx = DeviceContext::host().unwrap();
        let outcomes = upload_all(&ctx, &mut reader).unwrap();
        assert!(matches!(
            outcomes[0].tensor,
            Err(DequantError::UnsupportedFormat { ggml_type: GgmlType::BF16 })
        ));
        assert!(matches!(
            outcomes[1].tensor,
            Err(DequantError::UnsupportedFormat { ggml_type: GgmlType::Unknown(16) })
        ));
        assert!(outcomes[2].tensor.is_ok());
        assert_eq!(outcomes[2].offset, reader.tensor_info("w").unwrap().offset());
        assert!(outcomes[2].offset > 0);
    }

    #[test]
    fn test_gguf_oversized_shape_is_a_format_error() {
        let file = build_gguf(
            &[TensorDef { name: "huge", shape: &[1 << 40, 1 << 40], ggml_type: GgmlType::Q4_0, data: &[] }],
            32,
        );
        let mut reader = GgufReader::from_bytes(&file).unwrap();
        assert_eq!(reader.tensor_info("huge").unwrap().num_elements(), None);
        assert!(matches!(reader.read_tensor("huge"), Err(DequantError::Format { .. })));

        let ctx = DeviceContext::host().unwrap();
        assert!(matches!(upload_all(&ctx, &mut reader), Err(DequantError::Format { .. })));
    }

    #[test]
    fn test_gguf_extent_past_end_of_file() {
        // 2^36 elements fit in u64 but the file holds none of them.
        let file = build_gguf(
            &[TensorDef { name: "big", shape: &[1 << 30, 64], ggml_type: GgmlType::Q4_0, data: &[] }],
            32,
        );
        let mut reader = GgufReader::from_bytes(&file).unwrap();
        assert_eq!(reader.tensor_info("big").unwrap().byte_size(), Some((1u64 << 31) * 18));
        let err = reader.tensor_data("big").unwrap_err();
        assert!(matches!(err, DequantError::Format { ref reason } if reason.contains("past the end")), "{err}");
    }

    #[test]
    fn test_gguf_from_path() {
        let q4 = quantize_row_q4_0(&ramp(32)).unwrap();
        let file = build_gguf(
            &[TensorDef { name: "w", shape: &[32], ggml_type: GgmlType::Q4_0, data: &q4 }],
            32,
        );
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(&file).unwrap();

        let mut reader = GgufReader::from_path(tmp.path()).unwrap();
        assert_eq!(reader.tensor_data("w").unwrap(), q4);

        assert!(matches!(
            GgufReader::from_path(tmp.path().with_extension("missing")),
            Err(DequantError::Io(_))
        ));
    }

    // =========================================================================
    // Upload
    // =========================================================================

    #[test]
    fn test_upload_all_reports_each_tensor() {
        let values = ramp(32 * 8);
        let q4 = quantize_row_q4_0(&values).unwrap();
        let f16s = vec![0u8; 2 * 16];
        let f32s = f32_to_bytes(&ramp(16));
        let file = build_gguf(
            &[
                TensorDef { name: "q4", shape: &[64, 4], ggml_type: GgmlType::Q4_0, data: &q4 },
                TensorDef { name: "half", shape: &[16], ggml_type: GgmlType::F16, data: &f16s },
                TensorDef { name: "norm", shape: &[16], ggml_type: GgmlType::F32, data: &f32s },
            ],
            32,
        );

        let ctx = DeviceContext::host().unwrap();
        let mut reader = GgufReader::from_bytes(&file).unwrap();
        let outcomes = upload_all(&ctx, &mut reader).unwrap();
        assert_eq!(outcomes.len(), 3);

        let q4_tensor = outcomes[0].tensor.as_ref().unwrap();
        assert_eq!(q4_tensor.ne(), [64, 4]);
        assert_eq!(q4_tensor.weight_stride(), 64);
        assert_eq!(q4_tensor.metadata_stride(), 64);

        assert!(matches!(
            outcomes[1].tensor,
            Err(DequantError::UnsupportedFormat { ggml_type: GgmlType::F16 })
        ));
        assert_eq!(outcomes[2].name, "norm");
        assert!(outcomes[2].tensor.is_ok());

        let mut want = vec![0f32; values.len()];
        dequantize_row_q4_0(&q4, &mut want).unwrap();
        let got = dequantize(q4_tensor, values.len(), &DispatchConfig::for_context(&ctx)).unwrap();
        for (g, w) in got.iter().zip(&want) {
            assert_eq!(*g, half::f16::from_f32(*w).to_f32());
        }
    }
}
