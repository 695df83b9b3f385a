//! Float→RGBA encoder (C5): packs a single `float64` band into a 4-channel
//! `uint8` image via sign/exponent/mantissa packing, so that `nearest`-filtered
//! sampling on a browser still recovers the original float client-side.
//!
//! Ported from the bit-packing scheme in the reference tiler's
//! `encode_raster_to_rgba` (the formula is reproduced verbatim in spec.md
//! §4.5; this module is the direct, literal implementation of it plus its
//! inverse for testing the round-trip invariant).

const MANTISSA_BIAS: f64 = 8_388_608.0; // 2^23

/// Three-valued sign: `-1`, `0`, or `1`. Differs from `f64::signum`, which
/// treats `+0.0`/`-0.0` as positive/negative rather than zero — the spec's
/// formula requires `sgn(0) == 0` so that `norm = 1 − sign²` becomes `1` and
/// the `exp = ⌊log₂(m + norm)⌋` term stays finite for `v == 0`.
fn sgn(v: f64) -> f64 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Encodes `v` against `nodata` into an RGBA quadruplet. `tolerance` is the
/// absolute-difference threshold under which `v` is treated as nodata (spec
/// §9 Open Question: made configurable rather than a hard-coded `1e-6`).
pub fn encode(v: f64, nodata: f64, tolerance: f64) -> [u8; 4] {
    if v == nodata || (v - nodata).abs() < tolerance {
        return [0, 0, 0, 0];
    }

    let sign = sgn(v);
    let m = v.abs();
    let norm = 1.0 - sign * sign;
    let exp = (m + norm).log2().floor();
    let mantissa = MANTISSA_BIAS + sign + sign * MANTISSA_BIAS * (m / 2f64.powf(exp) - 1.0);
    let mantissa = mantissa.round().clamp(0.0, 16_777_215.0) as u32;

    let r = (mantissa / 65536) as u8;
    let g = ((mantissa % 65536) / 256) as u8;
    let b = (mantissa - r as u32 * 65536 - g as u32 * 256) as u8;
    let a = (exp + 128.0).round().clamp(0.0, 255.0) as u8;

    [r, g, b, a]
}

/// Inverse of [`encode`]. Returns `None` for the `(0,0,0,0)` transparency
/// marker (nodata), `Some(v)` otherwise.
pub fn decode(rgba: [u8; 4]) -> Option<f64> {
    if rgba == [0, 0, 0, 0] {
        return None;
    }

    let [r, g, b, a] = rgba;
    let mantissa = (r as i64) * 65536 + (g as i64) * 256 + (b as i64);
    let exp = (a as i64 - 128) as f64;
    let bias = MANTISSA_BIAS as i64;

    let (sign, m) = match mantissa.cmp(&bias) {
        std::cmp::Ordering::Equal => (0.0, 0.0),
        std::cmp::Ordering::Greater => {
            let frac = (mantissa - bias - 1) as f64 / MANTISSA_BIAS + 1.0;
            (1.0, frac * 2f64.powf(exp))
        }
        std::cmp::Ordering::Less => {
            let frac = 2.0 - (mantissa + 1) as f64 / MANTISSA_BIAS;
            (-1.0, frac * 2f64.powf(exp))
        }
    };

    Some(sign * m)
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODATA: f64 = -9_999_999.0;

    #[test]
    fn encode_nodata_is_fully_transparent() {
        assert_eq!(encode(NODATA, NODATA, 1e-6), [0, 0, 0, 0]);
    }

    #[test]
    fn encode_near_nodata_within_tolerance_is_transparent() {
        assert_eq!(encode(NODATA + 1e-7, NODATA, 1e-6), [0, 0, 0, 0]);
    }

    #[test]
    fn round_trip_invariant_2() {
        for v in [-1e6, -1.0, -1e-3, 0.0, 1e-3, 1.0, 1e6] {
            let rgba = encode(v, NODATA, 1e-6);
            let back = decode(rgba).expect("non-nodata value must decode to Some");
            if v == 0.0 {
                assert_eq!(back, 0.0);
            } else {
                let rel_err = ((back - v) / v).abs();
                assert!(
                    rel_err <= 2f64.powi(-22),
                    "v={v} back={back} rel_err={rel_err}"
                );
            }
        }
    }

    #[test]
    fn s2_scenario_single_pixel_quarter() {
        let rgba = encode(0.25, NODATA, 1e-6);
        assert_ne!(rgba[3], 0, "alpha must be non-zero for a real value");
        let back = decode(rgba).unwrap();
        assert!((back - 0.25).abs() < 3e-8, "back={back}");
    }

    #[test]
    fn outside_raster_pixels_decode_transparent() {
        assert_eq!(decode([0, 0, 0, 0]), None);
    }
}
