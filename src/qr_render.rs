use crate::error::GatewayError;
use base64::Engine as _;
use base64::prelude::BASE64_STANDARD;
use image::{ImageBuffer, Luma};
use qrcode::{Color, EcLevel, QrCode};

const MODULE_SIZE: u32 = 4;
const QUIET_ZONE: u32 = 4;

/// Renders a challenge payload as PNG bytes.
pub fn render_png(payload: &str) -> Result<Vec<u8>, GatewayError> {
    let code = QrCode::with_error_correction_level(payload.as_bytes(), EcLevel::M)
        .map_err(|e| GatewayError::QrRender(e.to_string()))?;

    let modules = code.width() as u32;
    let size = (modules + QUIET_ZONE * 2) * MODULE_SIZE;

    let img = ImageBuffer::from_fn(size, size, |x, y| {
        let (cx, cy) = (x / MODULE_SIZE, y / MODULE_SIZE);
        if cx < QUIET_ZONE || cy < QUIET_ZONE {
            return Luma([255u8]);
        }
        let (mx, my) = (cx - QUIET_ZONE, cy - QUIET_ZONE);
        if mx >= modules || my >= modules {
            return Luma([255u8]);
        }
        match code[(mx as usize, my as usize)] {
            Color::Dark => Luma([0u8]),
            Color::Light => Luma([255u8]),
        }
    });

    let mut buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| GatewayError::QrRender(e.to_string()))?;
    Ok(buf.into_inner())
}

/// Renders a challenge payload as a `data:image/png;base64,` URL.
pub fn render_data_url(payload: &str) -> Result<String, GatewayError> {
    let png = render_png(payload)?;
    Ok(format!("data:image/png;base64,{}", BASE64_STANDARD.encode(png)))
}
