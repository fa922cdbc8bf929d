use anyhow::{Context, Result};
use base64::Engine;
use image::{codecs::png::PngEncoder, ExtendedColorType, ImageEncoder};

/// Encode a planar (CHW) 8-bit image as a PNG data URL.
///
/// One channel is written as grayscale, three as RGB.
pub fn encode_planar_png_data_url(
    channels: usize,
    width: u32,
    height: u32,
    pixels: &[u8],
) -> Result<String> {
    let plane = (width * height) as usize;
    if pixels.len() != channels * plane {
        anyhow::bail!(
            "pixel buffer length {} does not match {}-channel image size {}x{}",
            pixels.len(),
            channels,
            width,
            height
        );
    }

    let color = match channels {
        1 => ExtendedColorType::L8,
        3 => ExtendedColorType::Rgb8,
        other => anyhow::bail!("unsupported channel count {other}"),
    };

    let mut interleaved = Vec::with_capacity(pixels.len());
    for offset in 0..plane {
        for channel in 0..channels {
            interleaved.push(pixels[channel * plane + offset]);
        }
    }

    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(&interleaved, width, height, color)
        .context("failed to encode PNG data")?;

    let base64 = base64::engine::general_purpose::STANDARD.encode(&buffer);
    Ok(format!("data:image/png;base64,{base64}"))
}
