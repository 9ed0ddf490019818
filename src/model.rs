use std::path::Path;

use crate::{
    errors::{Result, WasteSegError},
    prediction::{InstanceMask, InstancePredictions},
    traits::InstanceSegmentationModel,
};
use image::{imageops, imageops::FilterType, ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

const INPUT_NAME: &str = "images";
const DETECTION_OUTPUT: &str = "output0";
const PROTO_OUTPUT: &str = "output1";
const DEFAULT_INPUT_SIZE: u32 = 640;
const LETTERBOX_FILL: u8 = 114;
const NMS_IOU_THRESHOLD: f32 = 0.7;
const MAX_DETECTIONS: usize = 300;
const MASK_THRESHOLD: f32 = 0.5;

/// YOLOv8-seg モデルの ONNX Runtime アダプター
///
/// 入力は `images` (1, 3, S, S)、出力は `output0` (1, 4 + nc + nm, N) と
/// `output1` (1, nm, mh, mw) のプロトタイプマスク
pub struct OnnxSegmentationModel {
    pub image_size: u32,
    class_names: Option<Vec<String>>,
    session: Mutex<Session>,
}

impl OnnxSegmentationModel {
    pub fn new(model_path: &Path, device_id: i32) -> Result<Self> {
        let session = SessionBuilder::new()
            .map_err(|e| WasteSegError::model("セッションビルダー初期化", e))?
            .with_execution_providers([
                TensorRTExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
                CUDAExecutionProvider::default()
                    .with_device_id(device_id)
                    .build(),
            ])
            .map_err(|e| WasteSegError::model("実行プロバイダー設定", e))?
            .with_memory_pattern(true)
            .map_err(|e| WasteSegError::model("メモリパターン設定", e))?
            .commit_from_file(model_path)
            .map_err(|e| {
                WasteSegError::model(format!("モデルファイル読み込み: {}", model_path.display()), e)
            })?;

        let shape = session.inputs[0].input_type.tensor_shape().ok_or_else(|| {
            WasteSegError::model(
                "モデル入力形状取得",
                std::io::Error::new(std::io::ErrorKind::InvalidData, "テンソル形状が取得できません"),
            )
        })?;
        // 動的形状 (-1) の場合は既定サイズ
        let image_size = match shape.get(2).copied() {
            Some(size) if size > 0 => size as u32,
            _ => DEFAULT_INPUT_SIZE,
        };

        let class_names = session
            .metadata()
            .and_then(|metadata| metadata.custom("names"))
            .ok()
            .flatten()
            .and_then(|raw| parse_names_metadata(&raw));

        match &class_names {
            Some(names) => info!(classes = ?names, image_size, "model loaded"),
            None => warn!(image_size, "model metadata has no class names"),
        }

        Ok(Self {
            image_size,
            class_names,
            session: Mutex::new(session),
        })
    }

    /// 生のテンソル出力 (検出ヘッド, プロトタイプ) を返す
    pub fn run(&self, tensor: ArrayView4<f32>) -> Result<(Array3<f32>, Array3<f32>)> {
        let mut binding = self.session.lock();
        let outputs = binding.run(
            ort::inputs![INPUT_NAME => TensorRef::from_array_view(&tensor.as_standard_layout())?],
        )?;
        let detections = outputs[DETECTION_OUTPUT]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix3>()?
            .to_owned();
        let protos = outputs[PROTO_OUTPUT]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .index_axis_move(Axis(0), 0)
            .to_owned();
        Ok((detections, protos))
    }
}

impl InstanceSegmentationModel for OnnxSegmentationModel {
    fn predict(&self, image: &RgbImage, confidence: f32) -> Result<InstancePredictions> {
        let (tensor, letterbox) = preprocess(image, self.image_size);
        let (output, protos) = self.run(tensor.view())?;
        debug!(output = ?output.shape(), protos = ?protos.shape(), "inference output");

        let candidates = decode_detections(output.view(), protos.shape()[0], confidence)?;
        let kept = non_max_suppression(candidates, NMS_IOU_THRESHOLD, MAX_DETECTIONS);

        let (width, height) = image.dimensions();
        let mut predictions = InstancePredictions::empty();
        for detection in &kept {
            let mask = assemble_mask(detection, protos.view(), &letterbox, width, height)?;
            predictions.push(mask, detection.class_index);
        }
        Ok(predictions)
    }

    fn class_names(&self) -> Option<Vec<String>> {
        self.class_names.clone()
    }
}

/// レターボックス変換のジオメトリ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub size: u32,
    pub pad_x: u32,
    pub pad_y: u32,
    pub width: u32,
    pub height: u32,
}

impl Letterbox {
    pub fn new(width: u32, height: u32, size: u32) -> Self {
        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let scaled_w = ((width as f32 * scale).round() as u32).clamp(1, size);
        let scaled_h = ((height as f32 * scale).round() as u32).clamp(1, size);
        Self {
            size,
            pad_x: (size - scaled_w) / 2,
            pad_y: (size - scaled_h) / 2,
            width: scaled_w,
            height: scaled_h,
        }
    }
}

/// アスペクト比を保ったまま正方形に縮小し、灰色でパディングして NCHW テンソル化
pub fn preprocess(image: &RgbImage, image_size: u32) -> (Array4<f32>, Letterbox) {
    let (width, height) = image.dimensions();
    let letterbox = Letterbox::new(width, height, image_size);

    let resized = imageops::resize(image, letterbox.width, letterbox.height, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(image_size, image_size, Rgb([LETTERBOX_FILL; 3]));
    imageops::replace(
        &mut canvas,
        &resized,
        i64::from(letterbox.pad_x),
        i64::from(letterbox.pad_y),
    );

    let tensor = canvas
        .as_ndarray3()
        .map(|v| f32::from(*v) / 255.0)
        .insert_axis(Axis(0));
    (tensor, letterbox)
}

/// NMS 前の検出候補（レターボックス座標系）
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_index: usize,
    pub coefficients: Vec<f32>,
}

/// 検出ヘッド出力 (1, 4 + nc + nm, N) をデコード
pub fn decode_detections(
    output: ArrayView3<f32>,
    mask_dim: usize,
    confidence: f32,
) -> Result<Vec<Detection>> {
    let rows = output.shape()[1];
    if rows <= 4 + mask_dim {
        return Err(WasteSegError::model(
            "検出ヘッドのデコード",
            format!("unexpected output rows {} for {} mask coefficients", rows, mask_dim),
        ));
    }
    let num_classes = rows - 4 - mask_dim;
    let head = output.index_axis(Axis(0), 0);

    let mut detections = Vec::new();
    for anchor in head.axis_iter(Axis(1)) {
        let scores = anchor.slice(s![4..4 + num_classes]);
        let Some((class_index, &score)) = scores
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            continue;
        };
        if score < confidence {
            continue;
        }

        let (cx, cy, w, h) = (anchor[0], anchor[1], anchor[2], anchor[3]);
        detections.push(Detection {
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            score,
            class_index,
            coefficients: anchor.slice(s![4 + num_classes..]).to_vec(),
        });
    }
    Ok(detections)
}

pub fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
    let iy = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
    let intersection = ix * iy;
    let area = |r: &[f32; 4]| (r[2] - r[0]).max(0.0) * (r[3] - r[1]).max(0.0);
    let union = area(a) + area(b) - intersection;
    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// クラス別 NMS。スコア降順で返す
pub fn non_max_suppression(
    mut detections: Vec<Detection>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Detection> {
    detections.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Detection> = Vec::new();
    for candidate in detections {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept.iter().any(|k| {
            k.class_index == candidate.class_index && iou(&k.bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// 係数とプロトタイプからマスクを合成し、元画像サイズの二値マスクにする
pub fn assemble_mask(
    detection: &Detection,
    protos: ArrayView3<f32>,
    letterbox: &Letterbox,
    width: u32,
    height: u32,
) -> Result<InstanceMask> {
    let (mask_dim, proto_h, proto_w) = protos.dim();
    if detection.coefficients.len() != mask_dim {
        return Err(WasteSegError::model(
            "マスク合成",
            format!(
                "{} coefficients for {} prototypes",
                detection.coefficients.len(),
                mask_dim
            ),
        ));
    }

    let flat = protos
        .as_standard_layout()
        .into_owned()
        .into_shape_with_order((mask_dim, proto_h * proto_w))?;
    let coefficients = ArrayView1::from(&detection.coefficients[..]);
    let logits = coefficients.dot(&flat);

    // バウンディングボックス外はゼロ
    let sx = proto_w as f32 / letterbox.size as f32;
    let sy = proto_h as f32 / letterbox.size as f32;
    let [x1, y1, x2, y2] = detection.bbox;
    let (x1, x2) = (x1 * sx, x2 * sx);
    let (y1, y2) = (y1 * sy, y2 * sy);

    let proto_mask = ImageBuffer::from_fn(proto_w as u32, proto_h as u32, |x, y| {
        let (fx, fy) = (x as f32, y as f32);
        if fx >= x1 && fx < x2 && fy >= y1 && fy < y2 {
            Luma([sigmoid(logits[y as usize * proto_w + x as usize])])
        } else {
            Luma([0.0f32])
        }
    });

    Ok(postprocess_mask(&proto_mask, letterbox, width, height))
}

/// プロトタイプ解像度のマスクを入力解像度に拡大し、パディングを除いて元画像に戻す
pub fn postprocess_mask(
    mask: &ImageBuffer<Luma<f32>, Vec<f32>>,
    letterbox: &Letterbox,
    width: u32,
    height: u32,
) -> InstanceMask {
    let upscaled = imageops::resize(mask, letterbox.size, letterbox.size, FilterType::Triangle);
    let cropped = imageops::crop_imm(
        &upscaled,
        letterbox.pad_x,
        letterbox.pad_y,
        letterbox.width,
        letterbox.height,
    )
    .to_image();
    let restored = imageops::resize(&cropped, width, height, FilterType::Triangle);

    let mut binary = restored;
    for Luma([value]) in binary.pixels_mut() {
        *value = if *value > MASK_THRESHOLD { 1.0 } else { 0.0 };
    }
    binary
}

/// `{0: 'Metal', 1: 'Mixed waste'}` 形式のメタデータを解析
///
/// クラス名は引用符で区切るため、名前にカンマを含んでもよい
pub fn parse_names_metadata(raw: &str) -> Option<Vec<String>> {
    let mut rest = raw.trim().strip_prefix('{')?.strip_suffix('}')?.trim_start();
    let mut entries = Vec::new();

    while !rest.is_empty() {
        let (index, value) = rest.split_once(':')?;
        let index = index.trim().trim_matches(['\'', '"']).parse::<usize>().ok()?;

        let value = value.trim_start();
        let quote = value.chars().next().filter(|c| matches!(c, '\'' | '"'))?;
        let value = &value[1..];
        let end = value.find(quote)?;
        entries.push((index, value[..end].to_string()));

        let tail = value[end + 1..].trim_start();
        rest = tail.strip_prefix(',').unwrap_or(tail).trim_start();
    }

    if entries.is_empty() {
        return None;
    }
    entries.sort_by_key(|(index, _)| *index);
    Some(entries.into_iter().map(|(_, name)| name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prediction::foreground_pixels;

    fn detection(bbox: [f32; 4], score: f32, class_index: usize) -> Detection {
        Detection {
            bbox,
            score,
            class_index,
            coefficients: vec![1.0],
        }
    }

    #[test]
    fn test_letterbox_geometry() {
        let lb = Letterbox::new(1280, 640, 640);
        assert_eq!((lb.width, lb.height), (640, 320));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 160));

        let square = Letterbox::new(100, 100, 640);
        assert_eq!((square.width, square.height, square.pad_x, square.pad_y), (640, 640, 0, 0));
    }

    #[test]
    fn test_preprocess_pads_with_gray() {
        let image = RgbImage::from_pixel(8, 4, Rgb([255, 0, 0]));
        let (tensor, lb) = preprocess(&image, 8);

        assert_eq!(tensor.shape(), &[1, 3, 8, 8]);
        assert_eq!(lb.pad_y, 2);
        assert!((tensor[[0, 0, 0, 0]] - 114.0 / 255.0).abs() < 1e-6);
        assert!((tensor[[0, 0, 4, 4]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 1, 4, 4]].abs() < 1e-6);
    }

    #[test]
    fn test_iou() {
        let a = [0.0, 0.0, 10.0, 10.0];
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
        assert!((iou(&a, &[5.0, 0.0, 15.0, 10.0]) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_is_class_aware() {
        let kept = non_max_suppression(
            vec![
                detection([0.0, 0.0, 10.0, 10.0], 0.6, 0),
                detection([0.0, 0.0, 10.0, 10.0], 0.9, 0),
                detection([0.0, 0.0, 10.0, 10.0], 0.8, 1),
                detection([50.0, 50.0, 60.0, 60.0], 0.3, 0),
            ],
            0.7,
            300,
        );

        let scores: Vec<f32> = kept.iter().map(|d| d.score).collect();
        assert_eq!(scores, vec![0.9, 0.8, 0.3]);
    }

    #[test]
    fn test_decode_detections_filters_by_confidence() -> Result<()> {
        // 2 classes, 1 mask coefficient, 2 anchors
        let output = Array3::from_shape_vec(
            (1, 7, 2),
            vec![
                10.0, 30.0, // cx
                10.0, 30.0, // cy
                4.0, 6.0, // w
                2.0, 6.0, // h
                0.1, 0.2, // class 0
                0.8, 0.1, // class 1
                0.5, -0.5, // coefficient
            ],
        )?;

        let detections = decode_detections(output.view(), 1, 0.25)?;
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class_index, 1);
        assert_eq!(detections[0].bbox, [8.0, 9.0, 12.0, 11.0]);
        assert_eq!(detections[0].coefficients, vec![0.5]);

        assert!(decode_detections(output.view(), 3, 0.25).is_err());
        Ok(())
    }

    #[test]
    fn test_assemble_mask_crops_to_box() -> Result<()> {
        let protos = Array3::from_elem((1, 4, 4), 4.0f32);
        let lb = Letterbox::new(8, 8, 8);
        let det = Detection {
            bbox: [0.0, 0.0, 4.0, 8.0],
            score: 0.9,
            class_index: 0,
            coefficients: vec![1.0],
        };

        let mask = assemble_mask(&det, protos.view(), &lb, 8, 8)?;
        assert_eq!(mask.dimensions(), (8, 8));
        assert_eq!(mask.get_pixel(0, 4).0[0], 1.0);
        assert_eq!(mask.get_pixel(7, 4).0[0], 0.0);
        let area = foreground_pixels(&mask);
        assert!(area > 16 && area < 48, "area {}", area);
        Ok(())
    }

    #[test]
    fn test_parse_names_metadata() {
        assert_eq!(
            parse_names_metadata("{0: 'Metal', 1: 'Mixed waste', 2: 'Paper&Cardboard'}"),
            Some(vec![
                "Metal".to_string(),
                "Mixed waste".to_string(),
                "Paper&Cardboard".to_string()
            ])
        );
        assert_eq!(
            parse_names_metadata("{1: \"Wood, treated\", 0: 'Metal'}"),
            Some(vec!["Metal".to_string(), "Wood, treated".to_string()])
        );
        assert_eq!(parse_names_metadata("{0: Metal}"), None);
        assert_eq!(parse_names_metadata("not a dict"), None);
        assert_eq!(parse_names_metadata("{}"), None);
    }
}
