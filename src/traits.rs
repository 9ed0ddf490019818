use crate::composition::PercentageMap;
use crate::errors::Result;
use crate::history::HistoryRecord;
use crate::prediction::InstancePredictions;
use image::RgbImage;

/// インスタンスセグメンテーションモデルの抽象化
///
/// 依存関係逆転原則（DIP）に従い、パイプラインは具象モデルではなくこの契約に依存する
pub trait InstanceSegmentationModel: Send + Sync {
    /// 正規化済みRGB画像に対して推論を一回実行する
    ///
    /// An empty `InstancePredictions` is a successful run with no detections;
    /// `Err` means the model itself failed.
    fn predict(&self, image: &RgbImage, confidence: f32) -> Result<InstancePredictions>;

    /// 診断用のクラス名テーブル（モデルが持つ場合のみ）
    fn class_names(&self) -> Option<Vec<String>> {
        None
    }
}

impl<M: InstanceSegmentationModel + ?Sized> InstanceSegmentationModel for &M {
    fn predict(&self, image: &RgbImage, confidence: f32) -> Result<InstancePredictions> {
        (**self).predict(image, confidence)
    }

    fn class_names(&self) -> Option<Vec<String>> {
        (**self).class_names()
    }
}

/// 解析履歴ストアの抽象化
///
/// Append-only with auto-incrementing ids. Implementations serialize writes.
pub trait HistoryStore: Send + Sync {
    /// 解析結果を一件保存し、採番されたIDを返す
    fn save(
        &self,
        image: &str,
        image_hash: Option<&str>,
        confidence: f32,
        percentages: &PercentageMap,
    ) -> Result<i64>;

    /// 全履歴をタイムスタンプ昇順で取得
    fn load_all(&self) -> Result<Vec<HistoryRecord>>;

    /// 最新の一件を削除（削除したIDを返す）
    fn delete_latest(&self) -> Result<Option<i64>>;

    /// 全件削除（削除件数を返す）
    fn delete_all(&self) -> Result<usize>;
}
