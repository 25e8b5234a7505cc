use ndarray::{Array2, Array3};

use crate::error::{Error, Result};

/// Upper bound of a scaled patch distance; 0 is identical, this value is maximally dissimilar.
pub const DISTANCE_SCALE: i32 = 65535;

/// SSD contribution of a single fully-penalized channel (value + both gradients, each at max delta).
const SSD_SCALE: i64 = 9 * 255 * 255;

/// Separable binomial-ish kernel used by `downsample`.
const DOWNSAMPLE_KERNEL: [i32; 6] = [1, 5, 10, 10, 5, 1];

/// A color image paired with a validity mask, plus its once-computed gradient planes.
///
/// Gradients are computed eagerly at construction (see design notes): there is no
/// interior-mutability cache to race on, and every `MaskedImage` in the pyramid or EM loop
/// is ready to feed [`distance`] the moment it exists.
#[derive(Debug, Clone)]
pub struct MaskedImage {
    image: Array3<u8>,
    mask: Array2<u8>,
    gradient_x: Array3<u8>,
    gradient_y: Array3<u8>,
}

impl MaskedImage {
    /// Wrap an existing (image, mask) pair. `image` must be (H, W, 3); `mask` must be (H, W).
    pub fn new(image: Array3<u8>, mask: Array2<u8>) -> Result<Self> {
        let shape = image.shape();
        if shape[2] != 3 || shape[0] != mask.shape()[0] || shape[1] != mask.shape()[1] {
            return Err(Error::InvalidShape);
        }
        let (gradient_x, gradient_y) = compute_gradients(&image);
        Ok(Self {
            image,
            mask,
            gradient_x,
            gradient_y,
        })
    }

    /// A zero-filled image of the given size, entirely masked.
    pub fn blank(width: usize, height: usize) -> Self {
        let image = Array3::<u8>::zeros((height, width, 3));
        let mask = Array2::<u8>::from_elem((height, width), 1);
        let (gradient_x, gradient_y) = compute_gradients(&image);
        Self {
            image,
            mask,
            gradient_x,
            gradient_y,
        }
    }

    /// Zero every mask entry in place (marks the whole image as known/valid).
    pub fn clear_mask(&mut self) {
        self.mask.fill(0);
    }

    pub fn image(&self) -> &Array3<u8> {
        &self.image
    }

    pub fn mask(&self) -> &Array2<u8> {
        &self.mask
    }

    /// (height, width).
    pub fn size(&self) -> (usize, usize) {
        let shape = self.image.shape();
        (shape[0], shape[1])
    }

    pub fn is_masked(&self, y: usize, x: usize) -> bool {
        self.mask[[y, x]] != 0
    }

    pub fn pixel(&self, y: usize, x: usize) -> [u8; 3] {
        [
            self.image[[y, x, 0]],
            self.image[[y, x, 1]],
            self.image[[y, x, 2]],
        ]
    }

    pub fn set_pixel(&mut self, y: usize, x: usize, value: [u8; 3]) {
        for c in 0..3 {
            self.image[[y, x, c]] = value[c];
        }
    }

    pub fn set_mask_value(&mut self, y: usize, x: usize, value: u8) {
        self.mask[[y, x]] = value;
    }

    /// True iff any pixel of the (2p+1)^2 window centered at (y,x), clipped to bounds, is masked.
    pub fn contains_mask(&self, y: usize, x: usize, patch_size: usize) -> bool {
        let (height, width) = self.size();
        let p = patch_size as isize;
        for dy in -p..=p {
            let yy = y as isize + dy;
            if yy < 0 || yy >= height as isize {
                continue;
            }
            for dx in -p..=p {
                let xx = x as isize + dx;
                if xx < 0 || xx >= width as isize {
                    continue;
                }
                if self.is_masked(yy as usize, xx as usize) {
                    return true;
                }
            }
        }
        false
    }

    /// Half-resolution image built from a 6x6 separable-kernel weighted average of unmasked
    /// source pixels. A destination pixel with no unmasked contributor remains masked.
    pub fn downsample(&self) -> Self {
        let (height, width) = self.size();
        let new_height = height / 2;
        let new_width = width / 2;

        let mut out = MaskedImage::blank(new_width, new_height);
        for y in (0..height.saturating_sub(1)).step_by(2) {
            for x in (0..width.saturating_sub(1)).step_by(2) {
                let mut sum = [0i64; 3];
                let mut ksum = 0i64;
                for dy in -2..=3 {
                    let yy = y as isize + dy;
                    if yy < 0 || yy >= height as isize {
                        continue;
                    }
                    for dx in -2..=3 {
                        let xx = x as isize + dx;
                        if xx < 0 || xx >= width as isize {
                            continue;
                        }
                        if self.is_masked(yy as usize, xx as usize) {
                            continue;
                        }
                        let k = DOWNSAMPLE_KERNEL[(dy + 2) as usize] * DOWNSAMPLE_KERNEL[(dx + 2) as usize];
                        let pixel = self.pixel(yy as usize, xx as usize);
                        for c in 0..3 {
                            sum[c] += pixel[c] as i64 * k as i64;
                        }
                        ksum += k as i64;
                    }
                }

                let ty = y / 2;
                let tx = x / 2;
                if ksum > 0 {
                    let value = [
                        (sum[0] / ksum) as u8,
                        (sum[1] / ksum) as u8,
                        (sum[2] / ksum) as u8,
                    ];
                    out.set_pixel(ty, tx, value);
                    out.set_mask_value(ty, tx, 0);
                } else {
                    out.set_mask_value(ty, tx, 1);
                }
            }
        }
        out.recompute_gradients();
        out
    }

    /// Nearest-neighbor resize to `(new_height, new_width)`; no interpolation.
    pub fn upsample(&self, new_width: usize, new_height: usize) -> Self {
        let (height, width) = self.size();
        let mut out = MaskedImage::blank(new_width, new_height);
        for y in 0..new_height {
            let yy = y * height / new_height;
            for x in 0..new_width {
                let xx = x * width / new_width;
                if self.is_masked(yy, xx) {
                    out.set_mask_value(y, x, 1);
                } else {
                    out.set_pixel(y, x, self.pixel(yy, xx));
                    out.set_mask_value(y, x, 0);
                }
            }
        }
        out.recompute_gradients();
        out
    }

    fn recompute_gradients(&mut self) {
        let (gradient_x, gradient_y) = compute_gradients(&self.image);
        self.gradient_x = gradient_x;
        self.gradient_y = gradient_y;
    }

    fn gradient_x_at(&self, y: usize, x: usize, c: usize) -> u8 {
        self.gradient_x[[y, x, c]]
    }

    fn gradient_y_at(&self, y: usize, x: usize, c: usize) -> u8 {
        self.gradient_y[[y, x, c]]
    }
}

/// `gx[y,x,c] = 128 + (image[y,x+1,c] - image[y,x-1,c]) / 2`, boundary rows/cols zeroed.
fn compute_gradients(image: &Array3<u8>) -> (Array3<u8>, Array3<u8>) {
    let shape = image.shape();
    let (height, width, channels) = (shape[0], shape[1], shape[2]);
    let mut gradient_x = Array3::<u8>::zeros((height, width, channels));
    let mut gradient_y = Array3::<u8>::zeros((height, width, channels));

    if height < 3 || width < 3 {
        return (gradient_x, gradient_y);
    }

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            for c in 0..channels {
                let gx = image[[y, x + 1, c]] as i32 - image[[y, x - 1, c]] as i32;
                let gy = image[[y + 1, x, c]] as i32 - image[[y - 1, x, c]] as i32;
                gradient_x[[y, x, c]] = (128 + gx / 2) as u8;
                gradient_y[[y, x, c]] = (128 + gy / 2) as u8;
            }
        }
    }
    (gradient_x, gradient_y)
}

/// The patch distance metric: intensity + oriented-gradient SSD, scaled into `[0, DISTANCE_SCALE]`.
///
/// Symmetric in `(source, ys, xs) <-> (target, yt, xt)`. Out-of-bounds or masked offsets incur
/// the maximum per-offset penalty `SSD_SCALE` rather than being skipped, so a handful of
/// boundary/masked samples can't make an otherwise-bad match look artificially cheap.
pub fn distance(
    source: &MaskedImage,
    ys: usize,
    xs: usize,
    target: &MaskedImage,
    yt: usize,
    xt: usize,
    patch_size: usize,
) -> i32 {
    let (source_height, source_width) = source.size();
    let (target_height, target_width) = target.size();

    let mut total: i64 = 0;
    let mut wsum: i64 = 0;

    let p = patch_size as isize;
    for dy in -p..=p {
        let yys = ys as isize + dy;
        let yyt = yt as isize + dy;
        for dx in -p..=p {
            wsum += 1;

            let xxs = xs as isize + dx;
            let xxt = xt as isize + dx;

            let source_in_bounds = yys > 0
                && yys < source_height as isize - 1
                && xxs > 0
                && xxs < source_width as isize - 1;
            let target_in_bounds = yyt > 0
                && yyt < target_height as isize - 1
                && xxt > 0
                && xxt < target_width as isize - 1;

            if !source_in_bounds || !target_in_bounds {
                total += SSD_SCALE;
                continue;
            }

            let (yys, xxs) = (yys as usize, xxs as usize);
            let (yyt, xxt) = (yyt as usize, xxt as usize);

            if source.is_masked(yys, xxs) || target.is_masked(yyt, xxt) {
                total += SSD_SCALE;
                continue;
            }

            let mut ssd: i64 = 0;
            for c in 0..3 {
                let s_value = source.image[[yys, xxs, c]] as i64;
                let t_value = target.image[[yyt, xxt, c]] as i64;
                let s_gx = source.gradient_x_at(yys, xxs, c) as i64;
                let t_gx = target.gradient_x_at(yyt, xxt, c) as i64;
                let s_gy = source.gradient_y_at(yys, xxs, c) as i64;
                let t_gy = target.gradient_y_at(yyt, xxt, c) as i64;

                ssd += (s_value - t_value).pow(2);
                ssd += (s_gx - t_gx).pow(2);
                ssd += (s_gy - t_gy).pow(2);
            }
            total += ssd;
        }
    }

    let normalized = total as f64 / SSD_SCALE as f64;
    let scaled = (DISTANCE_SCALE as f64 * normalized / wsum as f64).round();
    scaled.clamp(0.0, DISTANCE_SCALE as f64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn solid(width: usize, height: usize, color: [u8; 3]) -> MaskedImage {
        let mut image = Array3::<u8>::zeros((height, width, 3));
        for y in 0..height {
            for x in 0..width {
                for c in 0..3 {
                    image[[y, x, c]] = color[c];
                }
            }
        }
        let mask = Array2::<u8>::zeros((height, width));
        MaskedImage::new(image, mask).unwrap()
    }

    #[test]
    fn new_rejects_shape_mismatch() {
        let image = Array3::<u8>::zeros((4, 4, 3));
        let mask = Array2::<u8>::zeros((4, 5));
        assert!(matches!(
            MaskedImage::new(image, mask),
            Err(Error::InvalidShape)
        ));
    }

    #[test]
    fn new_rejects_wrong_channel_count() {
        let image = Array3::<u8>::zeros((4, 4, 4));
        let mask = Array2::<u8>::zeros((4, 4));
        assert!(matches!(
            MaskedImage::new(image, mask),
            Err(Error::InvalidShape)
        ));
    }

    #[test]
    fn clone_is_bitwise_equal() {
        let img = solid(8, 8, [10, 20, 30]);
        let cloned = img.clone();
        assert_eq!(img.image(), cloned.image());
        assert_eq!(img.mask(), cloned.mask());
    }

    #[test]
    fn contains_mask_detects_clipped_window() {
        let mut img = solid(10, 10, [0, 0, 0]);
        img.set_mask_value(0, 0, 1);
        assert!(img.contains_mask(1, 1, 1));
        assert!(!img.contains_mask(5, 5, 1));
    }

    #[test]
    fn distance_of_identical_patch_is_zero() {
        let img = solid(20, 20, [128, 128, 128]);
        let d = distance(&img, 10, 10, &img, 10, 10, 3);
        assert_eq!(d, 0);
    }

    #[rstest]
    #[case(10, 10, 12, 13)]
    #[case(5, 5, 15, 15)]
    fn distance_is_symmetric(#[case] ys: usize, #[case] xs: usize, #[case] yt: usize, #[case] xt: usize) {
        let source = solid(24, 24, [10, 200, 50]);
        let mut target = solid(24, 24, [10, 200, 50]);
        target.set_pixel(yt, xt, [250, 5, 90]);
        target.recompute_gradients();

        let forward = distance(&source, ys, xs, &target, yt, xt, 3);
        let backward = distance(&target, yt, xt, &source, ys, xs, 3);
        assert_eq!(forward, backward);
    }

    #[test]
    fn downsample_halves_dimensions() {
        let img = solid(16, 10, [5, 5, 5]);
        let down = img.downsample();
        assert_eq!(down.size(), (5, 8));
    }

    #[test]
    fn downsample_then_upsample_mask_implies_fully_masked_cell() {
        let mut img = solid(16, 16, [100, 100, 100]);
        // Mask a 2x2 block that maps exactly onto one downsampled cell.
        for y in 4..6 {
            for x in 4..6 {
                img.set_mask_value(y, x, 1);
            }
        }
        let down = img.downsample();
        let back = down.upsample(16, 16);
        for y in 0..16 {
            for x in 0..16 {
                if back.is_masked(y, x) {
                    let dy = y * down.size().0 / 16;
                    let dx = x * down.size().1 / 16;
                    assert!(down.is_masked(dy, dx));
                }
            }
        }
    }

    #[test]
    fn upsample_is_nearest_neighbor() {
        let img = solid(4, 4, [1, 2, 3]);
        let up = img.upsample(8, 8);
        assert_eq!(up.size(), (8, 8));
        assert_eq!(up.pixel(0, 0), [1, 2, 3]);
        assert_eq!(up.pixel(7, 7), [1, 2, 3]);
    }

    #[test]
    fn blank_image_is_fully_masked() {
        let img = MaskedImage::blank(5, 5);
        for y in 0..5 {
            for x in 0..5 {
                assert!(img.is_masked(y, x));
            }
        }
    }

    #[test]
    fn clear_mask_unmasks_everything() {
        let mut img = MaskedImage::blank(3, 3);
        img.clear_mask();
        for y in 0..3 {
            for x in 0..3 {
                assert!(!img.is_masked(y, x));
            }
        }
    }
}
