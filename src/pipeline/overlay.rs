use image::{GrayImage, Rgb, RgbImage};

use crate::pipeline::domain::{BoundingBox, MicroplasticResult, ParticleClass, PlanktonResult};
use crate::pipeline::stage::plankton::segment;

const BORDER: u32 = 2;
const PLANKTON_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const MASK_TINT: Rgb<u8> = Rgb([0, 128, 255]);
// Share of the tint in a masked pixel, out of 10.
const MASK_WEIGHT: u16 = 3;

fn particle_color(class: ParticleClass) -> Rgb<u8> {
    match class {
        ParticleClass::Fiber => Rgb([0, 255, 0]),
        ParticleClass::Fragment => Rgb([0, 0, 255]),
        ParticleClass::Pellet => Rgb([255, 0, 0]),
        ParticleClass::Film => Rgb([0, 255, 255]),
    }
}

/// Copy of `image` with every detection outlined: particles in their class colour,
/// plankton regions tinted by their segmentation mask and outlined in white.
pub fn render(
    image: &RgbImage,
    microplastic: Option<&MicroplasticResult>,
    plankton: Option<&PlanktonResult>,
) -> RgbImage {
    let mut canvas = image.clone();
    if let Some(plankton) = plankton {
        let (width, height) = canvas.dimensions();
        tint(&mut canvas, &segment(plankton, width, height));
        for detection in &plankton.detailed {
            draw_box(&mut canvas, &detection.roi_bbox, PLANKTON_COLOR);
        }
    }
    if let Some(microplastic) = microplastic {
        for particle in &microplastic.particles {
            draw_box(&mut canvas, &particle.bbox, particle_color(particle.class));
        }
    }
    canvas
}

fn tint(image: &mut RgbImage, mask: &GrayImage) {
    for (pixel, coverage) in image.pixels_mut().zip(mask.pixels()) {
        if coverage.0[0] == 0 {
            continue;
        }
        for (channel, tint) in pixel.0.iter_mut().zip(MASK_TINT.0) {
            *channel = ((*channel as u16 * (10 - MASK_WEIGHT) + tint as u16 * MASK_WEIGHT) / 10) as u8;
        }
    }
}

fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    let (x, y, w, h) = bbox.to_pixels(width, height);
    let x0 = x.min(width - 1);
    let y0 = y.min(height - 1);
    let x1 = (x + w).min(width - 1);
    let y1 = (y + h).min(height - 1);
    if x0 >= x1 || y0 >= y1 {
        return;
    }

    for offset in 0..BORDER {
        let top = y0 + offset;
        let bottom = y1.saturating_sub(offset);
        if top > bottom {
            break;
        }
        for px in x0..=x1 {
            image.put_pixel(px, top, color);
            image.put_pixel(px, bottom, color);
        }

        let left = x0 + offset;
        let right = x1.saturating_sub(offset);
        if left > right {
            break;
        }
        for py in y0..=y1 {
            image.put_pixel(left, py, color);
            image.put_pixel(right, py, color);
        }
    }
}
