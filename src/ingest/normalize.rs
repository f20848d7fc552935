use anyhow::{anyhow, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PixelFormat {
    Rgb24,
    Yuyv,
    Nv12,
}

impl PixelFormat {
    pub(crate) fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"RGB3" => Some(Self::Rgb24),
            b"YUYV" => Some(Self::Yuyv),
            b"NV12" => Some(Self::Nv12),
            _ => None,
        }
    }
}

/// Convert a captured buffer to tightly packed RGB24.
pub(crate) fn normalize_to_rgb(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    let plane = w
        .checked_mul(h)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    match format {
        PixelFormat::Rgb24 => {
            let expected = plane * 3;
            if pixels.len() < expected {
                return Err(anyhow!(
                    "RGB frame too short: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            Ok(pixels[..expected].to_vec())
        }
        PixelFormat::Yuyv => {
            let expected = plane * 2;
            if pixels.len() < expected {
                return Err(anyhow!(
                    "YUYV frame too short: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            let mut rgb = Vec::with_capacity(plane * 3);
            for quad in pixels[..expected].chunks_exact(4) {
                let u = quad[1] as f32 - 128.0;
                let v = quad[3] as f32 - 128.0;
                for y in [quad[0], quad[2]] {
                    rgb.extend_from_slice(&yuv_to_rgb(y as f32, u, v));
                }
            }
            Ok(rgb)
        }
        PixelFormat::Nv12 => {
            let expected = plane + plane / 2;
            if pixels.len() < expected {
                return Err(anyhow!(
                    "NV12 frame too short: expected {}, got {}",
                    expected,
                    pixels.len()
                ));
            }
            let mut rgb = vec![0u8; plane * 3];
            for j in 0..h {
                for i in 0..w {
                    let y = pixels[j * w + i] as f32;
                    let uv_index = plane + (j / 2) * w + (i / 2) * 2;
                    let u = pixels[uv_index] as f32 - 128.0;
                    let v = pixels[uv_index + 1] as f32 - 128.0;
                    let offset = (j * w + i) * 3;
                    rgb[offset..offset + 3].copy_from_slice(&yuv_to_rgb(y, u, v));
                }
            }
            Ok(rgb)
        }
    }
}

fn yuv_to_rgb(y: f32, u: f32, v: f32) -> [u8; 3] {
    [
        clamp_to_u8(y + 1.402 * v),
        clamp_to_u8(y - 0.344_136 * u - 0.714_136 * v),
        clamp_to_u8(y + 1.772 * u),
    ]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_chroma_is_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        assert_eq!(normalize_to_rgb(&nv12, 2, 2, PixelFormat::Nv12)?, vec![128u8; 12]);

        let yuyv = vec![90u8, 128, 90, 128];
        assert_eq!(normalize_to_rgb(&yuyv, 2, 1, PixelFormat::Yuyv)?, vec![90u8; 6]);
        Ok(())
    }

    #[test]
    fn short_buffers_are_rejected() {
        assert!(normalize_to_rgb(&[0u8; 5], 1, 2, PixelFormat::Rgb24).is_err());
        assert_eq!(PixelFormat::from_fourcc(b"MJPG"), None);
    }
}
