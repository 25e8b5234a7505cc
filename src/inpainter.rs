use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::masked_image::MaskedImage;
use crate::nnf::NearestNeighborField;
use crate::similarity;

/// Coarse-to-fine PatchMatch + EM inpainting driver.
///
/// Construct with [`Inpainter::new`], then call [`Inpainter::run`] (non-deterministic RNG) or
/// [`Inpainter::run_seeded`] (reproducible) to synthesize the masked region.
pub struct Inpainter {
    /// `None` iff the input mask is empty: `run()` then short-circuits without ever building
    /// a pyramid, per the spec's boundary behavior for an all-unmasked image.
    pyramid: Option<Vec<MaskedImage>>,
    patch_size: usize,
    preserve_known: bool,
    original: MaskedImage,
}

impl Inpainter {
    /// `image` is (H, W, 3) uint8, `mask` is (H, W) uint8 (non-zero = unknown).
    pub fn new(image: Array3<u8>, mask: Array2<u8>, patch_size: usize) -> Result<Self> {
        Self::with_options(image, mask, patch_size, false)
    }

    /// As [`Inpainter::new`], but additionally restores originally-unmasked pixels bit-exactly
    /// after `run()` (see design notes on non-bit-exact preservation through EM alone).
    pub fn with_preserve_known(
        image: Array3<u8>,
        mask: Array2<u8>,
        patch_size: usize,
    ) -> Result<Self> {
        Self::with_options(image, mask, patch_size, true)
    }

    fn with_options(
        image: Array3<u8>,
        mask: Array2<u8>,
        patch_size: usize,
        preserve_known: bool,
    ) -> Result<Self> {
        if patch_size == 0 {
            return Err(Error::InvalidPatchSize);
        }

        let original = MaskedImage::new(image, mask)?;
        if original.mask().iter().all(|&v| v != 0) {
            return Err(Error::AllMasked);
        }

        // An empty mask has nothing to inpaint: short-circuit before ever building a
        // pyramid, so a patch_size that would otherwise be "too large" for this image
        // is never even evaluated. This check must come before the pyramid-depth check
        // below, not after it.
        if !original.mask().iter().any(|&v| v != 0) {
            log::debug!("mask is empty, skipping pyramid construction");
            return Ok(Self {
                pyramid: None,
                patch_size,
                preserve_known,
                original,
            });
        }

        let mut pyramid = vec![original.clone()];
        loop {
            let (height, width) = pyramid.last().expect("pyramid always has >=1 level").size();
            if height > patch_size && width > patch_size {
                let next = pyramid.last().unwrap().downsample();
                pyramid.push(next);
            } else {
                break;
            }
        }

        if pyramid.len() < 2 {
            return Err(Error::InvalidPatchSize);
        }

        log::debug!(
            "built pyramid with {} levels for patch_size {}",
            pyramid.len(),
            patch_size
        );

        Ok(Self {
            pyramid: Some(pyramid),
            patch_size,
            preserve_known,
            original,
        })
    }

    /// Run with a fresh, non-deterministic RNG.
    pub fn run(&self) -> Result<Array3<u8>> {
        self.run_with(&mut rand::thread_rng())
    }

    /// Run deterministically: identical inputs and seed always produce byte-identical output.
    pub fn run_seeded(&self, seed: u64) -> Result<Array3<u8>> {
        let mut rng = StdRng::seed_from_u64(seed);
        self.run_with(&mut rng)
    }

    fn run_with(&self, rng: &mut impl Rng) -> Result<Array3<u8>> {
        let Some(pyramid) = self.pyramid.as_ref() else {
            log::debug!("mask is empty, short-circuiting without building a pyramid");
            return Ok(self.original.image().clone());
        };

        let coarsest = pyramid.len() - 1;
        if coarsest == 0 {
            return Err(Error::InternalInvariant(
                "pyramid has a single level after successful construction".into(),
            ));
        }

        let mut source;
        let mut target = pyramid[coarsest].clone();
        target.clear_mask();
        let mut source2target =
            NearestNeighborField::new(&pyramid[coarsest], &target, self.patch_size, rng);
        let mut target2source =
            NearestNeighborField::new(&target, &pyramid[coarsest], self.patch_size, rng);

        for level in (1..=coarsest).rev() {
            source = pyramid[level].clone();
            if level != coarsest {
                source2target =
                    NearestNeighborField::new_from(&source, &target, self.patch_size, &source2target, rng);
                target2source =
                    NearestNeighborField::new_from(&target, &source, self.patch_size, &target2source, rng);
            }

            log::trace!("expectation-maximization at level {level}");
            target = self.expectation_maximization(
                pyramid,
                &source,
                target,
                level,
                &mut source2target,
                &mut target2source,
                rng,
            );
        }

        if self.preserve_known {
            self.restore_known(&mut target);
        }

        Ok(target.image().clone())
    }

    fn expectation_maximization(
        &self,
        pyramid: &[MaskedImage],
        source: &MaskedImage,
        initial_target: MaskedImage,
        level: usize,
        source2target: &mut NearestNeighborField,
        target2source: &mut NearestNeighborField,
        rng: &mut impl Rng,
    ) -> MaskedImage {
        let nr_iters_em = 1 + 2 * level as u32;
        let nr_iters_nnf = (1 + level as u32).min(7);

        let mut target = initial_target;
        let mut result = target.clone();

        for iter_em in 0..nr_iters_em {
            if iter_em != 0 {
                target = result.clone();
            }

            let (source_h, source_w) = source.size();
            for i in 0..source_h {
                for j in 0..source_w {
                    if !source.contains_mask(i, j, self.patch_size) {
                        source2target.set_identity(i, j);
                        target2source.set_identity(i, j);
                    }
                }
            }

            source2target.minimize(source, &target, rng, nr_iters_nnf);
            target2source.minimize(&target, source, rng, nr_iters_nnf);

            let is_last = iter_em == nr_iters_em - 1;
            let (new_source, mut new_target) = if is_last {
                let new_source = pyramid[level - 1].clone();
                let (new_w, new_h) = (new_source.size().1, new_source.size().0);
                let new_target = target.upsample(new_w, new_h);
                (new_source, new_target)
            } else {
                (source.clone(), target.clone())
            };

            let (vote_h, vote_w) = new_target.size();
            let mut vote = Array3::<f64>::zeros((vote_h, vote_w, 4));

            let target_dims = target.size();
            self.expectation_step(source2target, true, &mut vote, &new_source, is_last, target_dims);
            self.expectation_step(target2source, false, &mut vote, &new_source, is_last, target_dims);

            maximization_step(&mut new_target, &vote);
            result = new_target;
        }

        result
    }

    fn expectation_step(
        &self,
        nnf: &NearestNeighborField,
        source2target: bool,
        vote: &mut Array3<f64>,
        new_source: &MaskedImage,
        upscaled: bool,
        target_dims: (usize, usize),
    ) {
        let (source_h, source_w) = nnf.source_size();
        let (target_h, target_w) = target_dims;
        let p = self.patch_size as isize;

        for i in 0..source_h {
            for j in 0..source_w {
                let (yp, xp, d) = nnf.at(i, j);
                let weight = similarity::weight(d);
                if weight <= 0.0 {
                    continue;
                }

                for di in -p..=p {
                    for dj in -p..=p {
                        let mut ys = i as isize + di;
                        let mut xs = j as isize + dj;
                        let mut yt = yp as isize + di;
                        let mut xt = xp as isize + dj;

                        if ys < 0 || ys >= source_h as isize || xs < 0 || xs >= source_w as isize {
                            continue;
                        }
                        if yt < 0 || yt >= target_h as isize || xt < 0 || xt >= target_w as isize {
                            continue;
                        }

                        if !source2target {
                            std::mem::swap(&mut ys, &mut yt);
                            std::mem::swap(&mut xs, &mut xt);
                        }

                        let (ys, xs, yt, xt) = (ys as usize, xs as usize, yt as usize, xt as usize);

                        if upscaled {
                            for uy in 0..2 {
                                for ux in 0..2 {
                                    weighted_copy(
                                        new_source,
                                        2 * ys + uy,
                                        2 * xs + ux,
                                        vote,
                                        2 * yt + uy,
                                        2 * xt + ux,
                                        weight,
                                    );
                                }
                            }
                        } else {
                            weighted_copy(new_source, ys, xs, vote, yt, xt, weight);
                        }
                    }
                }
            }
        }
    }

    fn restore_known(&self, result: &mut MaskedImage) {
        let (height, width) = self.original.size();
        for y in 0..height {
            for x in 0..width {
                if !self.original.is_masked(y, x) {
                    result.set_pixel(y, x, self.original.pixel(y, x));
                    result.set_mask_value(y, x, 0);
                }
            }
        }
    }
}

fn weighted_copy(
    source: &MaskedImage,
    source_y: usize,
    source_x: usize,
    vote: &mut Array3<f64>,
    target_y: usize,
    target_x: usize,
    weight: f64,
) {
    if source.is_masked(source_y, source_x) {
        return;
    }
    let pixel = source.pixel(source_y, source_x);
    for c in 0..3 {
        vote[[target_y, target_x, c]] += pixel[c] as f64 * weight;
    }
    vote[[target_y, target_x, 3]] += weight;
}

fn maximization_step(target: &mut MaskedImage, vote: &Array3<f64>) {
    let (height, width) = target.size();
    for i in 0..height {
        for j in 0..width {
            let total_weight = vote[[i, j, 3]];
            if total_weight > 0.0 {
                let mut value = [0u8; 3];
                for (c, slot) in value.iter_mut().enumerate() {
                    *slot = (vote[[i, j, c]] / total_weight).round().clamp(0.0, 255.0) as u8;
                }
                target.set_pixel(i, j, value);
                target.set_mask_value(i, j, 0);
            }
        }
    }
}

/// Inpaint `image`/`mask` with a non-deterministic RNG. Convenience wrapper over
/// [`Inpainter`] for one-shot callers.
pub fn inpaint(image: Array3<u8>, mask: Array2<u8>, patch_size: usize) -> Result<Array3<u8>> {
    Inpainter::new(image, mask, patch_size)?.run()
}

/// Inpaint `image`/`mask` deterministically from `seed`.
pub fn inpaint_seeded(
    image: Array3<u8>,
    mask: Array2<u8>,
    patch_size: usize,
    seed: u64,
) -> Result<Array3<u8>> {
    Inpainter::new(image, mask, patch_size)?.run_seeded(seed)
}
