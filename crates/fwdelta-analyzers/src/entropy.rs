//! Shannon entropy of byte content.
//!
//! Compressed or encrypted payloads score close to 8 bits/byte; code and
//! text score well below. Typical ranges:
//! - ASCII text: ~4.0-5.0
//! - ELF code sections: ~5.5-6.5
//! - Compressed or encrypted data: > 7.5

/// Compute Shannon entropy of `data` in bits per byte.
///
/// H = -Σ p(x) * log2(p(x)) over the 256 byte values.
///
/// Returns 0.0 for empty input.
///
/// # Examples
///
/// ```
/// use fwdelta_analyzers::entropy::shannon_entropy;
///
/// assert_eq!(shannon_entropy(b""), 0.0);
/// assert_eq!(shannon_entropy(b"aaaa"), 0.0);
/// assert!((shannon_entropy(b"abab") - 1.0).abs() < 1e-9);
/// ```
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }

    let mut freq = [0usize; 256];
    for &byte in data {
        freq[byte as usize] += 1;
    }

    let len = data.len() as f64;
    freq.iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum()
}

/// Entropy of the first `window` bytes of `data`.
pub fn window_entropy(data: &[u8], window: usize) -> f64 {
    shannon_entropy(&data[..data.len().min(window)])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uniform_bytes_reach_eight_bits() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        assert!((shannon_entropy(&data) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn text_is_well_below_threshold() {
        let text = b"service vold /system/bin/vold --blkid_context=u:r:blkid:s0";
        let h = shannon_entropy(text);
        assert!(h > 3.0 && h < 6.0, "{h}");
    }

    #[test]
    fn window_limits_sample() {
        let mut data = vec![0u8; 16];
        data.extend((0..=255u8).cycle().take(4096));
        assert_eq!(window_entropy(&data, 16), 0.0);
        assert!(window_entropy(&data, 8192) > 7.5);
    }
}
