//! Renders the transport's pairing payload as a displayable image.

use base64::Engine;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, Luma};
use qrcode::QrCode;

use wagate_common::Error;

/// Encode a pairing payload as a `data:image/png;base64,...` URL suitable
/// for direct embedding in a client `<img>` tag.
pub fn to_data_url(payload: &str) -> Result<String, Error> {
    let code = QrCode::new(payload.as_bytes())
        .map_err(|e| Error::Internal(format!("qr encode failed: {}", e)))?;
    let img = code
        .render::<Luma<u8>>()
        .min_dimensions(256, 256)
        .build();

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(
            img.as_raw(),
            img.width(),
            img.height(),
            ExtendedColorType::L8,
        )
        .map_err(|e| Error::Internal(format!("qr png encode failed: {}", e)))?;

    let encoded = base64::engine::general_purpose::STANDARD.encode(&png);
    Ok(format!("data:image/png;base64,{}", encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_a_png_data_url() {
        let url = to_data_url("2@abcdef0123456789,pairing-ref,keydata==").unwrap();
        assert!(url.starts_with("data:image/png;base64,"));
        assert!(url.len() > 100);
    }

    #[test]
    fn distinct_payloads_render_distinct_images() {
        let a = to_data_url("payload-a").unwrap();
        let b = to_data_url("payload-b").unwrap();
        assert_ne!(a, b);
    }
}
