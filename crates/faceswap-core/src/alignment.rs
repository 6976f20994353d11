//! Face alignment via 4-DOF similarity transform.
//!
//! Aligns detected faces to a canonical square crop using the five
//! InsightFace reference landmarks and least-squares estimation, and pastes
//! generated crops back into the full frame through the inverse transform.

use crate::pixels::PixelBuffer;

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

const CHANNELS: usize = 3;

/// Reference landmarks scaled to a `size`×`size` crop.
///
/// Multiples of 112 scale the template directly; other sizes use the
/// 128-pixel template, which is the 112 one shifted 8px right.
pub fn reference_landmarks(size: usize) -> [(f32, f32); 5] {
    let (ratio, diff_x) = if size % 112 == 0 {
        (size as f32 / 112.0, 0.0)
    } else {
        let ratio = size as f32 / 128.0;
        (ratio, 8.0 * ratio)
    };
    REFERENCE_LANDMARKS_112.map(|(x, y)| (x * ratio + diff_x, y * ratio))
}

/// Estimate a 2×3 similarity transform (4-DOF: scale, rotation, translation)
/// from `src` landmarks to `dst` landmarks using least-squares.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
pub fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Build overdetermined system A * [a, b, tx, ty]^T = B
    // For each point pair (sx, sy) -> (dx, dy):
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for i in 0..5 {
        let (sx, sy) = src[i];
        let (dx, dy) = dst[i];

        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let x = solve_4x4(&ata, &atb);
    let (a, b, tx, ty) = (x[0], x[1], x[2], x[3]);

    [a, -b, tx, b, a, ty]
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return [1.0, 0.0, 0.0, 0.0]; // degenerate landmarks: identity scale
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x
}

/// Map a point through the forward transform.
fn apply(matrix: &[f32; 6], x: f32, y: f32) -> (f32, f32) {
    (
        matrix[0] * x + matrix[1] * y + matrix[2],
        matrix[3] * x + matrix[4] * y + matrix[5],
    )
}

/// Invert a similarity transform. Returns `None` for a degenerate matrix.
pub fn invert_similarity(matrix: &[f32; 6]) -> Option<[f32; 6]> {
    let (a, b, tx, ty) = (matrix[0], matrix[3], matrix[2], matrix[5]);
    // M = [[a, -b], [b, a]], det = a^2 + b^2
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return None;
    }
    let ia = a / det;
    let ib = b / det;
    // M_inv = [[ia, ib], [-ib, ia]], t_inv = -M_inv * t
    Some([
        ia,
        ib,
        -(ia * tx + ib * ty),
        -ib,
        ia,
        -(-ib * tx + ia * ty),
    ])
}

/// Bilinear sample of one channel; out-of-bounds neighbours read as 0.
#[inline]
fn sample(data: &[u8], width: usize, height: usize, x: f32, y: f32, c: usize) -> f32 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let px = |xi: i32, yi: i32| -> f32 {
        if xi >= 0 && (xi as usize) < width && yi >= 0 && (yi as usize) < height {
            data[(yi as usize * width + xi as usize) * CHANNELS + c] as f32
        } else {
            0.0
        }
    };

    px(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + px(x0 + 1, y0) * fx * (1.0 - fy)
        + px(x0, y0 + 1) * (1.0 - fx) * fy
        + px(x0 + 1, y0 + 1) * fx * fy
}

/// Apply a 2×3 similarity warp to produce a square `out_size` crop.
///
/// Uses bilinear interpolation. Out-of-bounds pixels are filled with 0 (black).
fn warp_affine(frame: &PixelBuffer, matrix: &[f32; 6], out_size: usize) -> PixelBuffer {
    let mut output = PixelBuffer::zeroed(out_size as u32, out_size as u32, frame.order());
    let Some(inverse) = invert_similarity(matrix) else {
        return output;
    };

    let src_w = frame.width() as usize;
    let src_h = frame.height() as usize;
    let src = frame.data();
    let out = output.data_mut();

    for oy in 0..out_size {
        for ox in 0..out_size {
            let (sx, sy) = apply(&inverse, ox as f32, oy as f32);
            for c in 0..CHANNELS {
                let val = sample(src, src_w, src_h, sx, sy, c);
                out[(oy * out_size + ox) * CHANNELS + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    output
}

/// Align a detected face to a canonical `size`×`size` crop.
///
/// Returns the crop together with the frame→crop transform, which
/// [`paste_back`] needs to composite a generated crop into the frame.
pub fn align_face(frame: &PixelBuffer, landmarks: &[(f32, f32); 5], size: usize) -> (PixelBuffer, [f32; 6]) {
    let matrix = estimate_similarity_transform(landmarks, &reference_landmarks(size));
    (warp_affine(frame, &matrix, size), matrix)
}

/// Composite a square crop back into `frame` through the inverse of `matrix`
/// (the frame→crop transform returned by [`align_face`]).
///
/// The crop is blended with a mask that is opaque in the middle and fades
/// linearly to transparent over the outer tenth of the crop, so seams
/// between generated and original pixels are not visible.
pub fn paste_back(frame: &mut PixelBuffer, crop: &PixelBuffer, matrix: &[f32; 6]) {
    let Some(inverse) = invert_similarity(matrix) else {
        return;
    };
    let size = crop.width() as f32;
    let feather = (size / 10.0).max(1.0);

    // Bounding box of the crop's footprint in frame coordinates.
    let corners = [(0.0, 0.0), (size, 0.0), (0.0, size), (size, size)].map(|(x, y)| apply(&inverse, x, y));
    let min_x = corners.iter().map(|c| c.0).fold(f32::INFINITY, f32::min).floor().max(0.0) as usize;
    let min_y = corners.iter().map(|c| c.1).fold(f32::INFINITY, f32::min).floor().max(0.0) as usize;
    let max_x = (corners.iter().map(|c| c.0).fold(f32::NEG_INFINITY, f32::max).ceil() as usize)
        .min(frame.width() as usize);
    let max_y = (corners.iter().map(|c| c.1).fold(f32::NEG_INFINITY, f32::max).ceil() as usize)
        .min(frame.height() as usize);

    let frame_w = frame.width() as usize;
    let crop_w = crop.width() as usize;
    let crop_h = crop.height() as usize;
    let crop_data = crop.data();
    let out = frame.data_mut();

    for y in min_y..max_y {
        for x in min_x..max_x {
            let (cx, cy) = apply(matrix, x as f32, y as f32);
            let edge = cx.min(cy).min(size - 1.0 - cx).min(size - 1.0 - cy);
            if edge < 0.0 {
                continue;
            }
            let alpha = (edge / feather).clamp(0.0, 1.0);
            let base = (y * frame_w + x) * CHANNELS;
            for c in 0..CHANNELS {
                let generated = sample(crop_data, crop_w, crop_h, cx, cy, c);
                let original = out[base + c] as f32;
                let val = generated * alpha + original * (1.0 - alpha);
                out[base + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
}
