use std::sync::Arc;

use anyhow::Context;

use crate::foundation::error::{PinforgeError, PinforgeResult};

/// Decoded raster image in premultiplied RGBA8 form, ready for compositing.
#[derive(Clone, Debug)]
pub struct PreparedImage {
    pub width: u32,
    pub height: u32,
    pub rgba8_premul: Arc<Vec<u8>>,
}

/// Decode encoded image bytes and convert to premultiplied RGBA8.
pub fn decode_image(bytes: &[u8]) -> PinforgeResult<PreparedImage> {
    let dyn_img = image::load_from_memory(bytes).context("decode image from memory")?;
    let rgba = dyn_img.to_rgba8();
    let (width, height) = rgba.dimensions();
    if width == 0 || height == 0 {
        return Err(PinforgeError::image("decoded image has zero dimensions"));
    }

    let mut rgba8_premul = rgba.into_raw();
    premultiply_rgba8_in_place(&mut rgba8_premul);

    Ok(PreparedImage {
        width,
        height,
        rgba8_premul: Arc::new(rgba8_premul),
    })
}

/// Decode the payload of a `data:` URI.
pub fn decode_data_uri(src: &str) -> PinforgeResult<Vec<u8>> {
    let data_url = data_url::DataUrl::process(src)
        .map_err(|e| PinforgeError::image(format!("invalid data URI: {e:?}")))?;
    let (bytes, _fragment) = data_url
        .decode_to_vec()
        .map_err(|e| PinforgeError::image(format!("invalid data URI payload: {e:?}")))?;
    Ok(bytes)
}

fn premultiply_rgba8_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let a = px[3] as u16;
        if a == 0 {
            px[0] = 0;
            px[1] = 0;
            px[2] = 0;
            continue;
        }
        px[0] = ((px[0] as u16 * a + 127) / 255) as u8;
        px[1] = ((px[1] as u16 * a + 127) / 255) as u8;
        px[2] = ((px[2] as u16 * a + 127) / 255) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_png(width: u32, height: u32, pixel: [u8; 4]) -> Vec<u8> {
        use image::ImageEncoder;

        let mut raw = Vec::with_capacity((width * height * 4) as usize);
        for _ in 0..width * height {
            raw.extend_from_slice(&pixel);
        }
        let mut out = Vec::new();
        image::codecs::png::PngEncoder::new(&mut out)
            .write_image(&raw, width, height, image::ExtendedColorType::Rgba8)
            .unwrap();
        out
    }

    #[test]
    fn decodes_and_premultiplies() {
        let png = encode_png(2, 2, [255, 0, 0, 128]);
        let img = decode_image(&png).unwrap();
        assert_eq!((img.width, img.height), (2, 2));
        let px = &img.rgba8_premul[..4];
        assert_eq!(px[3], 128);
        assert_eq!(px[0], 128); // 255 premultiplied by alpha 128
        assert_eq!(px[1], 0);
    }

    #[test]
    fn rejects_garbage_bytes() {
        assert!(decode_image(b"definitely not an image").is_err());
    }

    #[test]
    fn rejects_malformed_data_uri() {
        assert!(decode_data_uri("data:;base64,!!!").is_err());
        assert!(decode_data_uri("not-a-data-uri").is_err());
    }
}
