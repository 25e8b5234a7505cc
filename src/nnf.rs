use ndarray::Array3;
use rand::Rng;

use crate::masked_image::{distance, MaskedImage, DISTANCE_SCALE};

/// Dense mapping from every patch center in a source image to its approximate nearest
/// patch center in a target image, maintained by PatchMatch propagation + random search.
///
/// Per design note (two-NNF aliasing), the field does not borrow `source`/`target`: every
/// method that needs them takes explicit references, so there is nothing to rebind when the
/// EM loop swaps in a new target between iterations.
#[derive(Debug, Clone)]
pub struct NearestNeighborField {
    /// shape (source_h, source_w, 3): (target_y, target_x, scaled_distance).
    field: Array3<i32>,
    patch_size: usize,
}

const DEFAULT_MAX_RETRY: u32 = 20;

impl NearestNeighborField {
    /// Allocate a field over `source` and fill it via [`Self::randomize`] with `reset = true`.
    pub fn new(
        source: &MaskedImage,
        target: &MaskedImage,
        patch_size: usize,
        rng: &mut impl Rng,
    ) -> Self {
        Self::new_with_retry(source, target, patch_size, rng, DEFAULT_MAX_RETRY)
    }

    pub fn new_with_retry(
        source: &MaskedImage,
        target: &MaskedImage,
        patch_size: usize,
        rng: &mut impl Rng,
        max_retry: u32,
    ) -> Self {
        let (height, width) = source.size();
        let field = Array3::<i32>::from_elem((height, width, 3), DISTANCE_SCALE);
        let mut nnf = Self { field, patch_size };
        nnf.randomize(source, target, rng, max_retry, true);
        nnf
    }

    /// Seed a field at `source`'s resolution from a coarser NNF `other`, then randomize the
    /// cells that didn't find a valid candidate while rescaling.
    pub fn new_from(
        source: &MaskedImage,
        target: &MaskedImage,
        patch_size: usize,
        other: &NearestNeighborField,
        rng: &mut impl Rng,
    ) -> Self {
        Self::new_from_with_retry(source, target, patch_size, other, rng, DEFAULT_MAX_RETRY)
    }

    pub fn new_from_with_retry(
        source: &MaskedImage,
        target: &MaskedImage,
        patch_size: usize,
        other: &NearestNeighborField,
        rng: &mut impl Rng,
        max_retry: u32,
    ) -> Self {
        let (height, width) = source.size();
        let (other_height, other_width) = other.source_size();
        let fi = height as f64 / other_height as f64;
        let fj = width as f64 / other_width as f64;

        let mut field = Array3::<i32>::from_elem((height, width, 3), DISTANCE_SCALE);
        for i in 0..height {
            let ilow = ((i as f64 / fi) as usize).min(other_height - 1);
            for j in 0..width {
                let jlow = ((j as f64 / fj) as usize).min(other_width - 1);
                let (oty, otx, _) = other.at(ilow, jlow);
                let ty = ((oty as f64) * fi) as i32;
                let tx = ((otx as f64) * fj) as i32;
                let d = distance(source, i, j, target, ty as usize, tx as usize, patch_size);
                field[[i, j, 0]] = ty;
                field[[i, j, 1]] = tx;
                field[[i, j, 2]] = d;
            }
        }

        let mut nnf = Self { field, patch_size };
        nnf.randomize(source, target, rng, max_retry, false);
        nnf
    }

    /// (source height, source width): the shape of the field itself.
    pub fn source_size(&self) -> (usize, usize) {
        let shape = self.field.shape();
        (shape[0], shape[1])
    }

    /// `(target_y, target_x, scaled_distance)` currently stored at `(y, x)`.
    pub fn at(&self, y: usize, x: usize) -> (i32, i32, i32) {
        (
            self.field[[y, x, 0]],
            self.field[[y, x, 1]],
            self.field[[y, x, 2]],
        )
    }

    /// Overwrite `(y, x)` with the trivially-best match: itself, at distance 0.
    pub fn set_identity(&mut self, y: usize, x: usize) {
        self.field[[y, x, 0]] = y as i32;
        self.field[[y, x, 1]] = x as i32;
        self.field[[y, x, 2]] = 0;
    }

    fn randomize(
        &mut self,
        source: &MaskedImage,
        target: &MaskedImage,
        rng: &mut impl Rng,
        max_retry: u32,
        reset: bool,
    ) {
        let (height, width) = self.source_size();
        let (target_height, target_width) = target.size();

        for i in 0..height {
            for j in 0..width {
                let mut d = if reset { DISTANCE_SCALE } else { self.field[[i, j, 2]] };
                if d < DISTANCE_SCALE {
                    continue;
                }

                let mut chosen = (self.field[[i, j, 0]], self.field[[i, j, 1]]);
                for _ in 0..max_retry {
                    let ty = rng.gen_range(0..target_height);
                    let tx = rng.gen_range(0..target_width);
                    d = distance(source, i, j, target, ty, tx, self.patch_size);
                    chosen = (ty as i32, tx as i32);
                    if d < DISTANCE_SCALE {
                        break;
                    }
                }
                self.field[[i, j, 0]] = chosen.0;
                self.field[[i, j, 1]] = chosen.1;
                self.field[[i, j, 2]] = d;
            }
        }
    }

    /// Alternating forward/backward propagation+random-search sweeps, `nr_pass` times.
    pub fn minimize(
        &mut self,
        source: &MaskedImage,
        target: &MaskedImage,
        rng: &mut impl Rng,
        nr_pass: u32,
    ) {
        let (height, width) = self.source_size();
        for _ in 0..nr_pass {
            for i in 0..height {
                for j in 0..width {
                    if self.field[[i, j, 2]] > 0 {
                        self.minimize_link(source, target, rng, i, j, 1);
                    }
                }
            }
            for i in (0..height).rev() {
                for j in (0..width).rev() {
                    if self.field[[i, j, 2]] > 0 {
                        self.minimize_link(source, target, rng, i, j, -1);
                    }
                }
            }
        }
    }

    fn try_improve(
        &mut self,
        source: &MaskedImage,
        target: &MaskedImage,
        y: usize,
        x: usize,
        candidate_y: i32,
        candidate_x: i32,
    ) {
        let (target_height, target_width) = target.size();
        if candidate_y < 0
            || candidate_x < 0
            || candidate_y as usize >= target_height
            || candidate_x as usize >= target_width
        {
            return;
        }
        let d = distance(
            source,
            y,
            x,
            target,
            candidate_y as usize,
            candidate_x as usize,
            self.patch_size,
        );
        if d < self.field[[y, x, 2]] {
            self.field[[y, x, 0]] = candidate_y;
            self.field[[y, x, 1]] = candidate_x;
            self.field[[y, x, 2]] = d;
        }
    }

    fn minimize_link(
        &mut self,
        source: &MaskedImage,
        target: &MaskedImage,
        rng: &mut impl Rng,
        y: usize,
        x: usize,
        direction: i32,
    ) {
        let (height, width) = self.source_size();
        let (target_height, target_width) = target.size();

        let y_neighbor = y as i32 - direction;
        if y_neighbor >= 0 && (y_neighbor as usize) < height {
            let (ny, nx, _) = self.at(y_neighbor as usize, x);
            self.try_improve(source, target, y, x, ny + direction, nx);
        }

        let x_neighbor = x as i32 - direction;
        if x_neighbor >= 0 && (x_neighbor as usize) < width {
            let (ny, nx, _) = self.at(y, x_neighbor as usize);
            self.try_improve(source, target, y, x, ny, nx + direction);
        }

        let (cur_y, cur_x, _) = self.at(y, x);
        let mut random_scale = target_height.max(target_width) as i32;
        while random_scale > 0 {
            let dy = rng.gen_range(-random_scale..=random_scale);
            let dx = rng.gen_range(-random_scale..=random_scale);
            let candidate_y = (cur_y + dy).clamp(0, target_height as i32 - 1);
            let candidate_x = (cur_x + dx).clamp(0, target_width as i32 - 1);
            self.try_improve(source, target, y, x, candidate_y, candidate_x);
            random_scale /= 2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn checkerboard(width: usize, height: usize) -> MaskedImage {
        let mut image = ndarray::Array3::<u8>::zeros((height, width, 3));
        for y in 0..height {
            for x in 0..width {
                let v = if (x + y) % 2 == 0 { 200 } else { 40 };
                for c in 0..3 {
                    image[[y, x, c]] = v;
                }
            }
        }
        let mask = Array2::<u8>::zeros((height, width));
        MaskedImage::new(image, mask).unwrap()
    }

    #[test]
    fn every_entry_stays_in_target_bounds() {
        let source = checkerboard(12, 12);
        let target = checkerboard(12, 12);
        let mut rng = StdRng::seed_from_u64(42);
        let mut nnf = NearestNeighborField::new(&source, &target, 2, &mut rng);
        nnf.minimize(&source, &target, &mut rng, 2);

        let (th, tw) = target.size();
        let (sh, sw) = source.size();
        for y in 0..sh {
            for x in 0..sw {
                let (ty, tx, d) = nnf.at(y, x);
                assert!(ty >= 0 && (ty as usize) < th);
                assert!(tx >= 0 && (tx as usize) < tw);
                let recomputed = distance(&source, y, x, &target, ty as usize, tx as usize, 2);
                assert_eq!(d, recomputed);
            }
        }
    }

    #[test]
    fn minimize_never_increases_distance() {
        let source = checkerboard(16, 16);
        let target = checkerboard(16, 16);
        let mut rng = StdRng::seed_from_u64(7);
        let mut nnf = NearestNeighborField::new(&source, &target, 2, &mut rng);

        let before: Vec<i32> = (0..16)
            .flat_map(|y| (0..16).map(move |x| (y, x)))
            .map(|(y, x)| nnf.at(y, x).2)
            .collect();

        nnf.minimize(&source, &target, &mut rng, 1);

        let after: Vec<i32> = (0..16)
            .flat_map(|y| (0..16).map(move |x| (y, x)))
            .map(|(y, x)| nnf.at(y, x).2)
            .collect();

        for (b, a) in before.iter().zip(after.iter()) {
            assert!(a <= b);
        }
    }

    #[test]
    fn minimize_zero_passes_is_a_noop() {
        let source = checkerboard(8, 8);
        let target = checkerboard(8, 8);
        let mut rng = StdRng::seed_from_u64(1);
        let mut nnf = NearestNeighborField::new(&source, &target, 1, &mut rng);
        let before = nnf.field.clone();
        nnf.minimize(&source, &target, &mut rng, 0);
        assert_eq!(nnf.field, before);
    }

    #[test]
    fn set_identity_is_exact() {
        let source = checkerboard(6, 6);
        let target = checkerboard(6, 6);
        let mut rng = StdRng::seed_from_u64(3);
        let mut nnf = NearestNeighborField::new(&source, &target, 1, &mut rng);
        nnf.set_identity(2, 3);
        assert_eq!(nnf.at(2, 3), (2, 3, 0));
    }

    #[test]
    fn new_from_seeds_from_coarser_field() {
        let coarse_source = checkerboard(6, 6);
        let coarse_target = checkerboard(6, 6);
        let mut rng = StdRng::seed_from_u64(11);
        let coarse = NearestNeighborField::new(&coarse_source, &coarse_target, 1, &mut rng);

        let fine_source = checkerboard(12, 12);
        let fine_target = checkerboard(12, 12);
        let fine = NearestNeighborField::new_from(&fine_source, &fine_target, 1, &coarse, &mut rng);
        assert_eq!(fine.source_size(), (12, 12));
    }
}
