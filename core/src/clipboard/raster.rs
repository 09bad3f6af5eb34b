//! Conversion between encoded image files and the RGBA buffers arboard exchanges

use std::borrow::Cow;
use std::io::Cursor;

use arboard::ImageData;
use image::{ImageFormat, RgbaImage};

use crate::{Error, Result};

/// Encode a clipboard image as PNG
pub(crate) fn encode_png(image: &ImageData<'_>) -> Result<Vec<u8>> {
    let (width, height) = match (u32::try_from(image.width), u32::try_from(image.height)) {
        (Ok(w), Ok(h)) => (w, h),
        _ => {
            return Err(Error::Clipboard(format!(
                "image too large: {}x{}",
                image.width, image.height
            )))
        }
    };

    let buffer = RgbaImage::from_raw(width, height, image.bytes.to_vec()).ok_or_else(|| {
        Error::Clipboard(format!("pixel data does not match {}x{} RGBA", width, height))
    })?;

    let mut out = Cursor::new(Vec::new());
    buffer
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|e| Error::Clipboard(format!("png encode: {}", e)))?;
    Ok(out.into_inner())
}

/// Decode an image file into a clipboard image.
///
/// `format` is a file extension such as "png" or "jpg"; names the decoder
/// does not know fall back to sniffing the bytes.
pub(crate) fn decode_image(format: &str, data: &[u8]) -> Result<ImageData<'static>> {
    let decoded = match ImageFormat::from_extension(format) {
        Some(known) => image::load_from_memory_with_format(data, known),
        None => image::load_from_memory(data),
    }
    .map_err(|e| Error::Clipboard(format!("cannot decode {} image: {}", format, e)))?;

    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    Ok(ImageData {
        width: width as usize,
        height: height as usize,
        bytes: Cow::Owned(rgba.into_raw()),
    })
}
