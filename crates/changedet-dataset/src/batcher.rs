//! Batching of chips into burn tensors.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;

use crate::chipped::Chip;

/// A batch of chips
#[derive(Clone, Debug)]
pub struct ChipBatch<B: Backend> {
    /// Stacked pre/post images with shape [batch_size, 2 * bands, height, width]
    pub images: Tensor<B, 4>,
    /// Change masks with shape [batch_size, 1, height, width]
    pub masks: Tensor<B, 4, Int>,
}

impl<B: Backend> ChipBatch<B> {
    pub fn len(&self) -> usize {
        self.images.dims()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pre-change and post-change halves of the image tensor
    pub fn split_images(&self) -> (Tensor<B, 4>, Tensor<B, 4>) {
        split_images(self.images.clone())
    }
}

/// Splits `[B, 2C, H, W]` into the pre `[B, C, H, W]` and post `[B, C, H, W]` halves
pub fn split_images<B: Backend>(images: Tensor<B, 4>) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let [batch, channels, height, width] = images.dims();
    let half = channels / 2;
    let pre = images
        .clone()
        .slice([0..batch, 0..half, 0..height, 0..width]);
    let post = images.slice([0..batch, half..channels, 0..height, 0..width]);
    (pre, post)
}

/// Batcher turning chips into [`ChipBatch`]es on one device
#[derive(Clone, Debug)]
pub struct ChipBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> ChipBatcher<B> {
    /// Create a new batcher for the given device
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<Chip, ChipBatch<B>> for ChipBatcher<B> {
    fn batch(&self, items: Vec<Chip>) -> ChipBatch<B> {
        let batch_size = items.len();
        let [channels, height, width] = items
            .first()
            .map(|chip| chip.image.shape())
            .unwrap_or([0, 0, 0]);

        let images_data: Vec<f32> = items
            .iter()
            .flat_map(|chip| chip.image.data().iter().copied())
            .collect();
        let masks_data: Vec<i64> = items
            .iter()
            .flat_map(|chip| chip.mask.data().iter().copied())
            .collect();

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, channels, height, width]),
            &self.device,
        );
        let masks = Tensor::<B, 4, Int>::from_data(
            TensorData::new(masks_data, [batch_size, 1, height, width]),
            &self.device,
        );

        ChipBatch { images, masks }
    }
}
