use crate::errors::{Result, WasteSegError};
use crate::prediction::{InstanceMask, InstancePredictions};
use crate::traits::InstanceSegmentationModel;
use image::{Luma, RgbImage};
use std::sync::atomic::{AtomicUsize, Ordering};

/// テスト用のインスタンス定義
///
/// 画像幅に対する割合で列範囲 `[start, end)` を指定し、全行を前景とする
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MockInstance {
    pub class_index: usize,
    pub start: f32,
    pub end: f32,
}

impl MockInstance {
    /// 画像全体を覆うインスタンス
    pub const fn full(class_index: usize) -> Self {
        Self {
            class_index,
            start: 0.0,
            end: 1.0,
        }
    }

    pub const fn columns(class_index: usize, start: f32, end: f32) -> Self {
        Self {
            class_index,
            start,
            end,
        }
    }

    fn mask_for(&self, width: u32, height: u32) -> InstanceMask {
        let from = (self.start * width as f32).round() as u32;
        let to = (self.end * width as f32).round() as u32;
        InstanceMask::from_fn(width, height, |x, _| {
            if x >= from && x < to {
                Luma([1.0])
            } else {
                Luma([0.0])
            }
        })
    }
}

/// テスト用のモックセグメンテーションモデル
///
/// 入力画像サイズに合わせたマスクを生成し、呼び出し回数を記録する
#[derive(Debug, Default)]
pub struct MockSegmentationModel {
    instances: Vec<MockInstance>,
    calls: AtomicUsize,
}

impl MockSegmentationModel {
    pub fn new(instances: Vec<MockInstance>) -> Self {
        Self {
            instances,
            calls: AtomicUsize::new(0),
        }
    }

    /// 何も検出しないモデル
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl InstanceSegmentationModel for MockSegmentationModel {
    fn predict(&self, image: &RgbImage, _confidence: f32) -> Result<InstancePredictions> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (width, height) = image.dimensions();

        let mut predictions = InstancePredictions::empty();
        for instance in &self.instances {
            predictions.push(instance.mask_for(width, height), instance.class_index);
        }
        Ok(predictions)
    }

    fn class_names(&self) -> Option<Vec<String>> {
        Some(
            crate::classes::ClassTable::waste_default()
                .names()
                .map(str::to_string)
                .collect(),
        )
    }
}

/// 常に失敗するモデル
#[derive(Debug, Clone, Copy, Default)]
pub struct FailingSegmentationModel;

impl InstanceSegmentationModel for FailingSegmentationModel {
    fn predict(&self, _image: &RgbImage, _confidence: f32) -> Result<InstancePredictions> {
        Err(WasteSegError::model(
            "mock inference",
            std::io::Error::new(std::io::ErrorKind::Other, "モデルが利用できません"),
        ))
    }
}

/// 指定した呼び出し順（0始まり）でのみ失敗するモデル
#[derive(Debug)]
pub struct FlakySegmentationModel {
    inner: MockSegmentationModel,
    fail_on: Vec<usize>,
}

impl FlakySegmentationModel {
    pub fn new(instances: Vec<MockInstance>, fail_on: Vec<usize>) -> Self {
        Self {
            inner: MockSegmentationModel::new(instances),
            fail_on,
        }
    }
}

impl InstanceSegmentationModel for FlakySegmentationModel {
    fn predict(&self, image: &RgbImage, confidence: f32) -> Result<InstancePredictions> {
        let call = self.inner.calls();
        let predictions = self.inner.predict(image, confidence)?;
        if self.fail_on.contains(&call) {
            return FailingSegmentationModel.predict(image, confidence);
        }
        Ok(predictions)
    }
}

/// テスト用のファクトリー関数
pub fn create_mock_model() -> MockSegmentationModel {
    MockSegmentationModel::new(vec![MockInstance::full(0)])
}
