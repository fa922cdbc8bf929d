use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use burn_dataset::Dataset;
use image::imageops::FilterType;
use log::{debug, info};

pub const CHANNELS: usize = 3;
const FOLD_PREFIX: &str = "fold_";
const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// One face image as CHW bytes plus a one-hot label.
#[derive(Clone, Debug, PartialEq)]
pub struct FaceItem {
    pub pixels: Vec<u8>,
    pub label: Vec<f32>,
}

impl FaceItem {
    pub fn new(pixels: Vec<u8>, class: usize, num_classes: usize) -> Self {
        Self {
            pixels,
            label: one_hot(class, num_classes),
        }
    }

    pub fn class_index(&self) -> usize {
        self.label
            .iter()
            .enumerate()
            .fold((0, f32::MIN), |best, (index, &value)| {
                if value > best.1 {
                    (index, value)
                } else {
                    best
                }
            })
            .0
    }
}

pub fn one_hot(class: usize, num_classes: usize) -> Vec<f32> {
    let mut label = vec![0.0; num_classes];
    if let Some(slot) = label.get_mut(class) {
        *slot = 1.0;
    }
    label
}

/// An in-memory partition of the dataset.
#[derive(Clone, Debug, Default)]
pub struct FaceSplit {
    items: Vec<FaceItem>,
}

impl FaceSplit {
    pub fn new(items: Vec<FaceItem>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[FaceItem] {
        &self.items
    }

    #[cfg(test)]
    pub fn targets(&self) -> Vec<usize> {
        self.items.iter().map(FaceItem::class_index).collect()
    }
}

impl Dataset<FaceItem> for FaceSplit {
    fn get(&self, index: usize) -> Option<FaceItem> {
        self.items.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

pub struct FaceDataset {
    pub train: FaceSplit,
    pub test: FaceSplit,
    pub channel_means: Vec<f32>,
    pub classes: Vec<String>,
    pub image_size: usize,
}

impl FaceDataset {
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }
}

/// Load `<root>/fold_<k>/<class>/<image>` folds, holding out `test_fold`.
///
/// Class indices follow the sorted union of class directory names across all
/// folds. Channel means are taken over the training partition only.
pub fn load_dataset(root: &Path, test_fold: usize, image_size: usize) -> Result<FaceDataset> {
    let folds = discover_folds(root)?;
    if !folds.iter().any(|(number, _)| *number == test_fold) {
        bail!(
            "fold {} not found under {} (available: {:?})",
            test_fold,
            root.display(),
            folds.iter().map(|(number, _)| *number).collect::<Vec<_>>()
        );
    }

    let mut classes = BTreeSet::new();
    for (_, dir) in &folds {
        for class_dir in sorted_entries(dir)? {
            if class_dir.is_dir() {
                classes.insert(file_name(&class_dir)?);
            }
        }
    }
    let classes: Vec<String> = classes.into_iter().collect();
    if classes.is_empty() {
        bail!("no class directories found under {}", root.display());
    }

    let mut train = Vec::new();
    let mut test = Vec::new();
    for (number, dir) in &folds {
        let items = load_fold(dir, &classes, image_size)?;
        debug!("fold {} contributed {} images", number, items.len());
        if *number == test_fold {
            test.extend(items);
        } else {
            train.extend(items);
        }
    }

    if train.is_empty() {
        bail!("training partition is empty (every image lives in fold {test_fold})");
    }
    if test.is_empty() {
        bail!("held-out fold {test_fold} contains no images");
    }

    let channel_means = channel_means(&train, CHANNELS);
    info!(
        "loaded {} training and {} held-out images across {} classes",
        train.len(),
        test.len(),
        classes.len()
    );

    Ok(FaceDataset {
        train: FaceSplit::new(train),
        test: FaceSplit::new(test),
        channel_means,
        classes,
        image_size,
    })
}

/// Per-channel mean over every pixel of `items`, rounded to two decimals.
pub fn channel_means(items: &[FaceItem], channels: usize) -> Vec<f32> {
    let mut sums = vec![0.0f64; channels];
    let mut count = 0usize;

    for item in items {
        let plane = item.pixels.len() / channels;
        for (channel, sum) in sums.iter_mut().enumerate() {
            *sum += item.pixels[channel * plane..(channel + 1) * plane]
                .iter()
                .map(|&value| f64::from(value))
                .sum::<f64>();
        }
        count += plane;
    }

    sums.into_iter()
        .map(|sum| {
            let mean = if count == 0 { 0.0 } else { sum / count as f64 };
            ((mean * 100.0).round() / 100.0) as f32
        })
        .collect()
}

fn discover_folds(root: &Path) -> Result<Vec<(usize, PathBuf)>> {
    let mut folds = Vec::new();
    for path in sorted_entries(root)? {
        if !path.is_dir() {
            continue;
        }
        let name = file_name(&path)?;
        if let Some(number) = name
            .strip_prefix(FOLD_PREFIX)
            .and_then(|suffix| suffix.parse::<usize>().ok())
        {
            folds.push((number, path));
        }
    }

    if folds.is_empty() {
        bail!("no {}<k> directories found under {}", FOLD_PREFIX, root.display());
    }
    folds.sort_by_key(|(number, _)| *number);
    Ok(folds)
}

fn load_fold(dir: &Path, classes: &[String], image_size: usize) -> Result<Vec<FaceItem>> {
    let mut items = Vec::new();
    for class_dir in sorted_entries(dir)? {
        if !class_dir.is_dir() {
            continue;
        }
        let name = file_name(&class_dir)?;
        let class = classes
            .iter()
            .position(|candidate| *candidate == name)
            .ok_or_else(|| anyhow!("unknown class directory {}", class_dir.display()))?;

        for path in sorted_entries(&class_dir)? {
            if is_image(&path) {
                let pixels = load_image(&path, image_size)?;
                items.push(FaceItem::new(pixels, class, classes.len()));
            }
        }
    }
    Ok(items)
}

fn load_image(path: &Path, image_size: usize) -> Result<Vec<u8>> {
    let side = u32::try_from(image_size).context("image size does not fit in u32")?;
    let rgb = image::open(path)
        .with_context(|| format!("failed to decode image {}", path.display()))?
        .to_rgb8();
    let resized = image::imageops::resize(&rgb, side, side, FilterType::Triangle);

    let plane = image_size * image_size;
    let mut pixels = vec![0u8; CHANNELS * plane];
    for (offset, pixel) in resized.pixels().enumerate() {
        for channel in 0..CHANNELS {
            pixels[channel * plane + offset] = pixel.0[channel];
        }
    }
    Ok(pixels)
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .map(|entry| entry.map(|entry| entry.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to read entries of {}", dir.display()))?;
    paths.sort();
    Ok(paths)
}

fn file_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("non UTF-8 path {}", path.display()))
}

fn is_image(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
            .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use image::{Rgb, RgbImage};

    pub(crate) fn write_image(path: &Path, color: [u8; 3]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        RgbImage::from_pixel(4, 4, Rgb(color)).save(path).unwrap();
    }

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write_image(&root.join("fold_1/female/a.png"), [10, 20, 30]);
        write_image(&root.join("fold_1/male/b.png"), [30, 40, 50]);
        write_image(&root.join("fold_2/female/c.png"), [200, 100, 0]);
        write_image(&root.join("fold_2/male/d.png"), [100, 50, 0]);
        write_image(&root.join("fold_2/male/e.png"), [0, 0, 0]);
        fs::write(root.join("fold_2/male/notes.txt"), "skip me").unwrap();
        dir
    }

    #[test]
    fn holds_out_requested_fold() {
        let dir = fixture();
        let dataset = load_dataset(dir.path(), 1, 4).unwrap();

        assert_eq!(dataset.classes, vec!["female", "male"]);
        assert_eq!(dataset.train.len(), 3);
        assert_eq!(dataset.test.len(), 2);
        assert_eq!(dataset.test.targets(), vec![0, 1]);
        assert_eq!(dataset.train.targets(), vec![0, 1, 1]);
    }

    #[test]
    fn means_come_from_training_partition() {
        let dir = fixture();
        let dataset = load_dataset(dir.path(), 1, 4).unwrap();

        assert_eq!(dataset.channel_means.len(), CHANNELS);
        assert_relative_eq!(dataset.channel_means[0], 100.0);
        assert_relative_eq!(dataset.channel_means[1], 50.0);
        assert_relative_eq!(dataset.channel_means[2], 0.0);
    }

    #[test]
    fn images_are_resized_to_chw() {
        let dir = fixture();
        let dataset = load_dataset(dir.path(), 2, 2).unwrap();
        let item = dataset.test.get(0).unwrap();

        assert_eq!(item.pixels.len(), CHANNELS * 2 * 2);
        assert_eq!(&item.pixels[..4], &[200; 4]);
        assert_eq!(&item.pixels[4..8], &[100; 4]);
        assert_eq!(item.label, vec![1.0, 0.0]);
    }

    #[test]
    fn missing_fold_is_an_error() {
        let dir = fixture();
        let err = load_dataset(dir.path(), 5, 4).err().unwrap();
        assert!(err.to_string().contains("fold 5 not found"));
    }

    #[test]
    fn missing_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_dataset(&dir.path().join("absent"), 1, 4).is_err());
    }

    #[test]
    fn means_are_rounded() {
        let items = vec![
            FaceItem::new(vec![1, 0, 0], 0, 2),
            FaceItem::new(vec![0, 1, 0], 0, 2),
            FaceItem::new(vec![0, 1, 1], 1, 2),
        ];
        let means = channel_means(&items, 3);
        assert_relative_eq!(means[0], 0.33);
        assert_relative_eq!(means[1], 0.67);
        assert_relative_eq!(means[2], 0.33);
    }

    #[test]
    fn class_index_reads_one_hot() {
        assert_eq!(FaceItem::new(vec![], 2, 4).class_index(), 2);
        assert_eq!(one_hot(1, 3), vec![0.0, 1.0, 0.0]);
    }
}
