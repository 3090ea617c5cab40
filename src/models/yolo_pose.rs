// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// YOLO pose 模型实现 (YOLOv8-pose / YOLO11-pose 的 ONNX 导出, 接口相同)
// 包含: 预处理、推理、后处理

use anyhow::{bail, Result};
use image::imageops::{self, FilterType};
use ndarray::{Array, Axis, IxDyn};
use tracing::debug;

use crate::config::ModelConfig;
use crate::types::{Bbox, Frame, Landmark, Point2, PoseResult};
use crate::{non_max_suppression, OrtBackend};

const CXYWH_OFFSET: usize = 4;
const KPT_STEP: usize = 3;

/// 缩放比例: 保持宽高比缩放到 (w1, h1) 以内
fn scale_wh(w0: f32, h0: f32, w1: f32, h1: f32) -> (f32, f32, f32) {
    let r = (w1 / w0).min(h1 / h0);
    (r, (w0 * r).round(), (h0 * r).round())
}

/// YOLO pose 后处理器 (纯函数, 不依赖推理会话)
///
/// 输出格式: `[batch, 4 + nc + 3*nk, anchors]`
/// - 0..4:   cx, cy, w, h (输入像素)
/// - 4..4+nc: 类别分数 (pose 模型 nc=1, 即"人")
/// - 末尾 3*nk: 每个关键点 (x, y, conf)
#[derive(Debug, Clone)]
pub struct YoloPoseDecoder {
    pub nk: usize,
    pub conf: f32,
    pub kconf: f32,
    pub iou: f32,
    pub width: u32,
    pub height: u32,
}

impl YoloPoseDecoder {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            nk: config.nk,
            conf: config.conf,
            kconf: config.kconf,
            iou: config.iou,
            width: config.input_size,
            height: config.input_size,
        }
    }

    /// 解码所有人 (NMS后按置信度降序), 坐标为原图像素
    pub fn decode_all(
        &self,
        preds: &Array<f32, IxDyn>,
        width_original: u32,
        height_original: u32,
    ) -> Result<Vec<(Bbox, Vec<Point2>)>> {
        if preds.ndim() != 3 {
            bail!("unexpected pose output rank {:?}", preds.shape());
        }
        let channels = preds.shape()[1];
        if channels < CXYWH_OFFSET + 1 + KPT_STEP * self.nk {
            bail!(
                "pose output has {} channels, expected at least {} for {} keypoints",
                channels,
                CXYWH_OFFSET + 1 + KPT_STEP * self.nk,
                self.nk
            );
        }
        let nc = channels - CXYWH_OFFSET - KPT_STEP * self.nk;

        let width_original = width_original as f32;
        let height_original = height_original as f32;
        let ratio =
            (self.width as f32 / width_original).min(self.height as f32 / height_original);

        let mut data: Vec<(Bbox, Vec<Point2>)> = Vec::new();
        // 单帧推理, 只看 batch 0
        let anchor = preds.index_axis(Axis(0), 0);
        for pred in anchor.axis_iter(Axis(1)) {
            // 只取"人"这一类
            let confidence = pred[CXYWH_OFFSET];
            if confidence < self.conf {
                continue;
            }
            if nc > 1 {
                let best_other = (1..nc)
                    .map(|c| pred[CXYWH_OFFSET + c])
                    .fold(f32::MIN, f32::max);
                if best_other > confidence {
                    continue;
                }
            }

            let cx = pred[0] / ratio;
            let cy = pred[1] / ratio;
            let w = pred[2] / ratio;
            let h = pred[3] / ratio;
            let bbox = Bbox::new(
                (cx - w / 2.).max(0.0).min(width_original),
                (cy - h / 2.).max(0.0).min(height_original),
                w,
                h,
                confidence,
            );

            let base = channels - KPT_STEP * self.nk;
            let mut kpts = Vec::with_capacity(self.nk);
            for i in 0..self.nk {
                let kx = pred[base + KPT_STEP * i] / ratio;
                let ky = pred[base + KPT_STEP * i + 1] / ratio;
                let kconf = pred[base + KPT_STEP * i + 2];
                if kconf < self.kconf {
                    kpts.push(Point2::default());
                } else {
                    kpts.push(Point2::new_with_conf(
                        kx.max(0.0).min(width_original),
                        ky.max(0.0).min(height_original),
                        kconf,
                    ));
                }
            }
            data.push((bbox, kpts));
        }

        non_max_suppression(&mut data, self.iou);
        Ok(data)
    }

    /// 解码为推送结果: 只保留排名第一的人, 坐标归一化到 [0,1]
    pub fn decode(
        &self,
        preds: &Array<f32, IxDyn>,
        width_original: u32,
        height_original: u32,
    ) -> Result<PoseResult> {
        let persons = self.decode_all(preds, width_original, height_original)?;
        if persons.len() > 1 {
            debug!("👥 检测到 {} 人, 只推送置信度最高的一个", persons.len());
        }
        let Some((_, kpts)) = persons.into_iter().next() else {
            return Ok(PoseResult::not_found());
        };

        let w0 = width_original as f32;
        let h0 = height_original as f32;
        let landmarks = kpts
            .iter()
            .map(|k| Landmark::new(k.x() / w0, k.y() / h0, 0.0, k.confidence()))
            .collect();
        Ok(PoseResult::with_landmarks(landmarks))
    }
}

/// YOLO pose 完整模型
pub struct YoloPose {
    engine: OrtBackend,
    decoder: YoloPoseDecoder,
}

impl YoloPose {
    pub fn new(engine: OrtBackend, config: &ModelConfig) -> Self {
        Self {
            engine,
            decoder: YoloPoseDecoder::new(config),
        }
    }

    /// letterbox: 等比缩放贴到左上角, 其余填充灰色 144/255
    pub fn preprocess(&self, frame: &Frame) -> Result<Array<f32, IxDyn>> {
        let Some(img) = frame.to_image() else {
            bail!(
                "frame {} buffer does not match {}x{}",
                frame.index,
                frame.width,
                frame.height
            );
        };
        let (width, height) = (self.engine.width(), self.engine.height());
        let mut ys = Array::ones((1, 3, height as usize, width as usize)).into_dyn();
        ys.fill(144.0 / 255.0);

        let (_, w_new, h_new) = scale_wh(
            frame.width as f32,
            frame.height as f32,
            width as f32,
            height as f32,
        );
        let img = imageops::resize(
            &img,
            (w_new as u32).max(1),
            (h_new as u32).max(1),
            FilterType::Triangle,
        );
        for (x, y, rgb) in img.enumerate_pixels() {
            let x = x as usize;
            let y = y as usize;
            let [r, g, b] = rgb.0;
            ys[[0, 0, y, x]] = (r as f32) / 255.0;
            ys[[0, 1, y, x]] = (g as f32) / 255.0;
            ys[[0, 2, y, x]] = (b as f32) / 255.0;
        }
        Ok(ys)
    }
}

impl super::PoseModel for YoloPose {
    fn infer(&mut self, frame: &Frame) -> Result<PoseResult> {
        let xs = self.preprocess(frame)?;
        let ys = self.engine.run(xs)?;
        self.decoder.decode(&ys[0], frame.width, frame.height)
    }

    fn num_keypoints(&self) -> usize {
        self.decoder.nk
    }

    fn summary(&self) {
        tracing::info!(
            "\nSummary:\n\
            > Model: YOLO pose\n\
            > EP: {:?}\n\
            > Height: {}, Width: {}\n\
            > nk: {}, conf: {}, kconf: {}, iou: {}",
            self.engine.ep(),
            self.engine.height(),
            self.engine.width(),
            self.decoder.nk,
            self.decoder.conf,
            self.decoder.kconf,
            self.decoder.iou,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder(nk: usize) -> YoloPoseDecoder {
        YoloPoseDecoder {
            nk,
            conf: 0.25,
            kconf: 0.5,
            iou: 0.45,
            width: 640,
            height: 640,
        }
    }

    /// (cx, cy, w, h, conf, 关键点)
    type Anchor = (f32, f32, f32, f32, f32, Vec<(f32, f32, f32)>);

    /// 构造 [1, 4+1+3nk, anchors] 的模型输出
    fn output(nk: usize, anchors: &[Anchor]) -> Array<f32, IxDyn> {
        let channels = 5 + 3 * nk;
        let mut ys = Array::zeros((1, channels, anchors.len())).into_dyn();
        for (j, (cx, cy, w, h, conf, kpts)) in anchors.iter().enumerate() {
            ys[[0, 0, j]] = *cx;
            ys[[0, 1, j]] = *cy;
            ys[[0, 2, j]] = *w;
            ys[[0, 3, j]] = *h;
            ys[[0, 4, j]] = *conf;
            for (i, (kx, ky, kc)) in kpts.iter().enumerate() {
                ys[[0, 5 + 3 * i, j]] = *kx;
                ys[[0, 5 + 3 * i + 1, j]] = *ky;
                ys[[0, 5 + 3 * i + 2, j]] = *kc;
            }
        }
        ys
    }

    #[test]
    fn test_scale_wh() {
        let (r, w, h) = scale_wh(1280.0, 720.0, 640.0, 640.0);
        assert!((r - 0.5).abs() < 1e-6);
        assert_eq!((w, h), (640.0, 360.0));
    }

    #[test]
    fn test_known_keypoints_are_normalized() {
        // 1280x720 原图, ratio = 0.5
        let nk = 17;
        let truth: Vec<(f32, f32)> = (0..nk)
            .map(|i| (0.1 + 0.04 * i as f32, 0.2 + 0.03 * i as f32))
            .collect();
        let kpts = truth
            .iter()
            .map(|(x, y)| (x * 1280.0 * 0.5, y * 720.0 * 0.5, 0.9))
            .collect();
        let ys = output(nk, &[(320.0, 180.0, 200.0, 300.0, 0.8, kpts)]);

        let r = decoder(nk).decode(&ys, 1280, 720).unwrap();
        assert!(r.found);
        let lms = r.landmarks.unwrap();
        assert_eq!(lms.len(), nk);
        for (lm, (x, y)) in lms.iter().zip(truth.iter()) {
            assert!((lm.x - x).abs() < 1e-4, "{} vs {}", lm.x, x);
            assert!((lm.y - y).abs() < 1e-4, "{} vs {}", lm.y, y);
            assert_eq!(lm.z, 0.0);
            assert!((lm.visibility - 0.9).abs() < 1e-6);
        }
    }

    #[test]
    fn test_low_confidence_keypoint_is_sentinel() {
        let nk = 17;
        let mut kpts: Vec<(f32, f32, f32)> = (0..nk).map(|_| (100.0, 100.0, 0.9)).collect();
        kpts[3] = (100.0, 100.0, 0.3);
        let ys = output(nk, &[(320.0, 320.0, 100.0, 100.0, 0.9, kpts)]);

        let lms = decoder(nk).decode(&ys, 640, 640).unwrap().landmarks.unwrap();
        assert_eq!((lms[3].x, lms[3].y, lms[3].visibility), (0.0, 0.0, 0.0));
        assert!(lms
            .iter()
            .filter(|l| l.x == 0.0 && l.y == 0.0)
            .all(|l| l.visibility == 0.0));
    }

    #[test]
    fn test_no_person_is_not_found() {
        let nk = 17;
        let kpts = (0..nk).map(|_| (10.0, 10.0, 0.9)).collect();
        let ys = output(nk, &[(320.0, 320.0, 100.0, 100.0, 0.1, kpts)]);
        let r = decoder(nk).decode(&ys, 640, 640).unwrap();
        assert_eq!(r, PoseResult::not_found());
    }

    #[test]
    fn test_highest_confidence_person_wins() {
        let nk = 1;
        let ys = output(
            nk,
            &[
                (100.0, 100.0, 50.0, 50.0, 0.6, vec![(100.0, 100.0, 0.9)]),
                (400.0, 400.0, 50.0, 50.0, 0.95, vec![(400.0, 320.0, 0.9)]),
            ],
        );
        let persons = decoder(nk).decode_all(&ys, 640, 640).unwrap();
        assert_eq!(persons.len(), 2);

        let lms = decoder(nk).decode(&ys, 640, 640).unwrap().landmarks.unwrap();
        assert!((lms[0].x - 400.0 / 640.0).abs() < 1e-4);
        assert!((lms[0].y - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_overlapping_persons_are_suppressed() {
        let nk = 1;
        let ys = output(
            nk,
            &[
                (100.0, 100.0, 50.0, 50.0, 0.9, vec![(100.0, 100.0, 0.9)]),
                (102.0, 101.0, 50.0, 50.0, 0.7, vec![(101.0, 100.0, 0.9)]),
            ],
        );
        let persons = decoder(nk).decode_all(&ys, 640, 640).unwrap();
        assert_eq!(persons.len(), 1);
        assert!((persons[0].0.confidence() - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_wrong_layout_is_rejected() {
        let ys = Array::zeros((1, 6, 10)).into_dyn();
        assert!(decoder(17).decode(&ys, 640, 640).is_err());
    }
}
