use std::iter::FusedIterator;

use anyhow::{bail, Result};
use rand::{rngs::StdRng, seq::SliceRandom};

/// One batch of borrowed samples together with its position in the run.
#[derive(Debug)]
pub struct Batch<'a, T> {
    pub epoch: usize,
    pub index: usize,
    pub items: Vec<&'a T>,
}

impl<'a, T> Batch<'a, T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Lazy batch sequence over a slice for a fixed number of epochs.
///
/// Each epoch visits every sample exactly once in `ceil(len / batch_size)`
/// batches; only the last batch of an epoch may be short. When constructed with
/// an RNG the visiting order is reshuffled at the start of every epoch. Once
/// exhausted the iterator stays exhausted.
pub struct BatchIter<'a, T> {
    items: &'a [T],
    batch_size: usize,
    num_epochs: usize,
    rng: Option<StdRng>,
    order: Vec<usize>,
    epoch: usize,
    cursor: usize,
    index: usize,
}

impl<'a, T> BatchIter<'a, T> {
    pub fn new(
        items: &'a [T],
        batch_size: usize,
        num_epochs: usize,
        rng: Option<StdRng>,
    ) -> Result<Self> {
        if batch_size == 0 {
            bail!("batch size must be positive");
        }

        Ok(Self {
            items,
            batch_size,
            num_epochs,
            rng,
            order: (0..items.len()).collect(),
            epoch: 0,
            cursor: 0,
            index: 0,
        })
    }

    /// Shuffled iteration for training.
    pub fn shuffled(
        items: &'a [T],
        batch_size: usize,
        num_epochs: usize,
        rng: StdRng,
    ) -> Result<Self> {
        Self::new(items, batch_size, num_epochs, Some(rng))
    }

    /// A single in-order pass, as used for evaluation.
    pub fn single_pass(items: &'a [T], batch_size: usize) -> Result<Self> {
        Self::new(items, batch_size, 1, None)
    }

    pub fn batches_per_epoch(&self) -> usize {
        self.items.len().div_ceil(self.batch_size)
    }

    fn remaining(&self) -> usize {
        if self.epoch >= self.num_epochs || self.items.is_empty() {
            return 0;
        }
        let per_epoch = self.batches_per_epoch();
        let done_this_epoch = self.cursor.div_ceil(self.batch_size);
        (self.num_epochs - self.epoch) * per_epoch - done_this_epoch
    }
}

impl<'a, T> Iterator for BatchIter<'a, T> {
    type Item = Batch<'a, T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.epoch >= self.num_epochs || self.items.is_empty() {
            return None;
        }

        if self.cursor == 0 {
            if let Some(rng) = self.rng.as_mut() {
                self.order.shuffle(rng);
            }
            self.index = 0;
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let items = self.order[self.cursor..end]
            .iter()
            .map(|&position| &self.items[position])
            .collect();
        let batch = Batch {
            epoch: self.epoch,
            index: self.index,
            items,
        };

        self.index += 1;
        self.cursor = end;
        if self.cursor >= self.order.len() {
            self.cursor = 0;
            self.epoch += 1;
        }

        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl<T> ExactSizeIterator for BatchIter<'_, T> {}

impl<T> FusedIterator for BatchIter<'_, T> {}
