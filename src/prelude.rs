//! `image`-crate convenience adapter, analogous to the teacher's `ImageInpaint` trait.

use std::ops::Deref;

use image::{ImageBuffer, Luma, Rgb};
use ndarray::{Array2, Array3};

use crate::error::Result;
use crate::Inpainter;

/// Inpaint implementations for `image::ImageBuffer`.
///
/// A thin conversion layer over the `ndarray`-based core API: no algorithmic work happens
/// here, just packing/unpacking the buffers `image` and `ndarray` each expect.
pub trait ImageInpaint {
    /// Inpaint with a non-deterministic RNG.
    fn patchmatch_inpaint<MaskContainer>(
        &self,
        mask: &ImageBuffer<Luma<u8>, MaskContainer>,
        patch_size: usize,
    ) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>>
    where
        MaskContainer: Deref<Target = [u8]>;

    /// Inpaint deterministically from `seed`.
    fn patchmatch_inpaint_seeded<MaskContainer>(
        &self,
        mask: &ImageBuffer<Luma<u8>, MaskContainer>,
        patch_size: usize,
        seed: u64,
    ) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>>
    where
        MaskContainer: Deref<Target = [u8]>;
}

impl<ImageContainer> ImageInpaint for ImageBuffer<Rgb<u8>, ImageContainer>
where
    ImageContainer: Deref<Target = [u8]>,
{
    fn patchmatch_inpaint<MaskContainer>(
        &self,
        mask: &ImageBuffer<Luma<u8>, MaskContainer>,
        patch_size: usize,
    ) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>>
    where
        MaskContainer: Deref<Target = [u8]>,
    {
        let (image, mask) = to_arrays(self, mask)?;
        let result = Inpainter::new(image, mask, patch_size)?.run()?;
        Ok(from_array(result))
    }

    fn patchmatch_inpaint_seeded<MaskContainer>(
        &self,
        mask: &ImageBuffer<Luma<u8>, MaskContainer>,
        patch_size: usize,
        seed: u64,
    ) -> Result<ImageBuffer<Rgb<u8>, Vec<u8>>>
    where
        MaskContainer: Deref<Target = [u8]>,
    {
        let (image, mask) = to_arrays(self, mask)?;
        let result = Inpainter::new(image, mask, patch_size)?.run_seeded(seed)?;
        Ok(from_array(result))
    }
}

fn to_arrays<ImageContainer, MaskContainer>(
    image: &ImageBuffer<Rgb<u8>, ImageContainer>,
    mask: &ImageBuffer<Luma<u8>, MaskContainer>,
) -> Result<(Array3<u8>, Array2<u8>)>
where
    ImageContainer: Deref<Target = [u8]>,
    MaskContainer: Deref<Target = [u8]>,
{
    let (width, height) = image.dimensions();
    let (width, height) = (width as usize, height as usize);
    let image = Array3::from_shape_vec((height, width, 3), image.as_raw().to_vec())?;
    let mask = Array2::from_shape_vec((height, width), mask.as_raw().to_vec())?;
    Ok((image, mask))
}

fn from_array(image: Array3<u8>) -> ImageBuffer<Rgb<u8>, Vec<u8>> {
    let shape = image.shape();
    let (height, width) = (shape[0] as u32, shape[1] as u32);
    ImageBuffer::from_raw(width, height, image.into_raw_vec_and_offset().0)
        .expect("array shape matches image dimensions by construction")
}
