use super::*;

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0f32, f32::max)
}

// =========================================================================
// Block layouts
// =========================================================================

#[test]
fn test_block_sizes_match_ggml() {
    assert_eq!(BlockQ4_0::BYTES, 18);
    assert_eq!(BlockQ6K::BYTES, 210);
    assert_eq!(GgmlType::Q4_0.block_bytes(), Some(18));
    assert_eq!(GgmlType::Q6_K.block_bytes(), Some(210));
    assert_eq!(GgmlType::F32.byte_size(10), Some(40));
    assert_eq!(GgmlType::BF16.byte_size(10), Some(20));
    assert_eq!(GgmlType::Q4_0.byte_size(64), Some(36));
    assert_eq!(GgmlType::Q6_K.byte_size(512), Some(420));
}

#[test]
fn test_byte_size_rejects_partial_blocks_and_overflow() {
    assert_eq!(GgmlType::Q4_0.byte_size(33), None);
    assert_eq!(GgmlType::F64.byte_size(usize::MAX), None);
    assert_eq!(GgmlType::Unknown(40).byte_size(32), None);
    assert_eq!(GgmlType::Unknown(40).block_elems(), None);
}

#[test]
fn test_dtype_codes_round_trip() {
    for code in (0u32..16).filter(|c| ![4, 5].contains(c)).chain(24..=28).chain([30]) {
        let t = GgmlType::from_code(code);
        assert!(!matches!(t, GgmlType::Unknown(_)), "code {code}");
        assert_eq!(t.code(), code);
    }
    // Removed Q4_2/Q4_3 and the IQ families stay addressable by code.
    for code in [4u32, 5, 16, 29, 99] {
        assert_eq!(GgmlType::from_code(code), GgmlType::Unknown(code));
        assert_eq!(GgmlType::from_code(code).code(), code);
    }
    assert_eq!(GgmlType::Unknown(20).to_string(), "type#20");
    assert_eq!(GgmlType::BF16.packing(), None);
}

#[test]
fn test_packing_spans_cover_block() {
    for t in [GgmlType::Q4_0, GgmlType::Q6_K] {
        let Some(Packing::Split {
            block_bytes,
            weights,
            metadata,
            ..
        }) = t.packing()
        else {
            panic!("{t} should split");
        };
        assert_eq!(weights.len + metadata.len, block_bytes, "{t}");
    }
    assert_eq!(GgmlType::F32.packing(), Some(Packing::NarrowF32));
    assert_eq!(GgmlType::F16.packing(), None);
    assert_eq!(GgmlType::Q8_0.packing(), None);
}

#[test]
fn test_q4_0_block_layout() {
    let mut qs = [0u8; 16];
    qs[0] = 0x9F; // element 0 -> 15, element 16 -> 9
    let block = BlockQ4_0 {
        d: half::f16::from_f32(0.5),
        qs,
    };
    let mut bytes = [0u8; BlockQ4_0::BYTES];
    block.write_to(&mut bytes);
    assert_eq!(BlockQ4_0::from_bytes(&bytes), block);

    let mut out = [0.0f32; 32];
    block.dequantize_into(&mut out);
    assert_eq!(out[0], 3.5);
    assert_eq!(out[16], 0.5);
    assert_eq!(out[1], -4.0);
}

// =========================================================================
// Reference quantizers
// =========================================================================

#[test]
fn test_q4_0_reference_ramp() {
    let x: Vec<f32> = (0..256).map(|i| i as f32 / 100.0).collect();
    let q = quantize_row_q4_0(&x).expect("quantize");
    assert_eq!(q.len(), 8 * BlockQ4_0::BYTES);

    let mut y = vec![0.0f32; x.len()];
    dequantize_row_q4_0(&q, &mut y).expect("dequantize");

    for (b, (xs, ys)) in x.chunks(32).zip(y.chunks(32)).enumerate() {
        let amax = xs.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        let step = amax / 8.0;
        let diff = max_abs_diff(xs, ys);
        assert!(diff <= step, "block {b}: diff {diff} > step {step}");
    }
}

#[test]
fn test_q4_0_reference_zero_block() {
    let x = vec![0.0f32; 32];
    let q = quantize_row_q4_0(&x).expect("quantize");
    let mut y = vec![1.0f32; 32];
    dequantize_row_q4_0(&q, &mut y).expect("dequantize");
    assert!(y.iter().all(|v| *v == 0.0));
}

#[test]
fn test_q4_0_reference_rejects_partial_block() {
    assert!(quantize_row_q4_0(&[0.0; 33]).is_err());
    let mut y = vec![0.0f32; 32];
    assert!(dequantize_row_q4_0(&[0u8; 17], &mut y).is_err());
}

#[test]
fn test_q6_k_reference_sine() {
    let x: Vec<f32> = (0..512).map(|i| (i as f32 * 0.05).sin() * 2.0).collect();
    let q = quantize_row_q6_k(&x).expect("quantize");
    assert_eq!(q.len(), 2 * BlockQ6K::BYTES);

    let mut y = vec![0.0f32; x.len()];
    dequantize_row_q6_k(&q, &mut y).expect("dequantize");

    let diff = max_abs_diff(&x, &y);
    // 6 bits over [-2, 2] plus 8-bit sub-scale rounding
    assert!(diff < 0.1, "max diff {diff}");
}

#[test]
fn test_q6_k_block_bit_order() {
    // Level 63 everywhere except element 64 (level 0) exercises both nibbles
    // and the high-bit plane.
    let mut block = BlockQ6K {
        ql: [0xFF; 128],
        qh: [0xFF; 64],
        scales: [1; 16],
        d: half::f16::from_f32(1.0),
    };
    block.ql[0] = 0x0F; // element 64 low bits -> 0
    block.qh[0] = 0b1100_1111; // element 64 high bits -> 0
    let mut out = [0.0f32; 256];
    block.dequantize_into(&mut out);
    assert_eq!(out[0], 31.0);
    assert_eq!(out[64], -32.0);
    assert_eq!(out[32], 31.0);
    assert_eq!(out[255], 31.0);
}

#[test]
fn test_q6_k_zero_block() {
    let x = vec![0.0f32; 256];
    let q = quantize_row_q6_k(&x).expect("quantize");
    let mut y = vec![1.0f32; 256];
    dequantize_row_q6_k(&q, &mut y).expect("dequantize");
    assert!(y.iter().all(|v| *v == 0.0));
}
