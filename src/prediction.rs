use image::{ImageBuffer, Luma};

/// Per-instance mask over the normalized image grid. Any nonzero value is
/// foreground.
pub type InstanceMask = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Output of one inference call: `masks[i]` belongs to `classes[i]`.
///
/// Construction does not validate the pairing; the composition engine does,
/// so that a broken adapter surfaces as `ShapeMismatch` instead of a panic.
#[derive(Debug, Clone, Default)]
pub struct InstancePredictions {
    pub masks: Vec<InstanceMask>,
    pub classes: Vec<usize>,
}

impl InstancePredictions {
    pub fn new(masks: Vec<InstanceMask>, classes: Vec<usize>) -> Self {
        Self { masks, classes }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mask: InstanceMask, class_index: usize) {
        self.masks.push(mask);
        self.classes.push(class_index);
    }

    /// Number of instances; zero means "no detection" to the pipelines.
    pub fn len(&self) -> usize {
        self.masks.len().max(self.classes.len())
    }

    pub fn is_empty(&self) -> bool {
        self.masks.is_empty() && self.classes.is_empty()
    }

    pub fn is_paired(&self) -> bool {
        self.masks.len() == self.classes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&InstanceMask, usize)> {
        self.masks.iter().zip(self.classes.iter().copied())
    }
}

/// Count foreground pixels of one mask.
pub fn foreground_pixels(mask: &InstanceMask) -> u64 {
    mask.pixels().filter(|Luma([v])| *v != 0.0).count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreground_counts_any_nonzero() {
        let mask = InstanceMask::from_raw(2, 2, vec![0.9, 0.0, -0.1, 0.0]).unwrap();
        assert_eq!(foreground_pixels(&mask), 2);
    }

    #[test]
    fn test_len_reports_longer_side() {
        let p = InstancePredictions::new(vec![InstanceMask::new(1, 1)], vec![0, 1]);
        assert_eq!(p.len(), 2);
        assert!(!p.is_paired());
        assert!(InstancePredictions::empty().is_empty());
    }
}
