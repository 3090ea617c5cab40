//! BlazePose 风格关键点跟踪模型
//!
//! 整帧缩放到模型输入 (默认 256x256, NHWC, 0..1), 输出:
//! - output 0: `N*5` 个值, 每个关键点 (x, y, z, visibility, presence), 输入像素坐标
//! - output 1 (可选): 人体存在分数 (logit)
//!
//! 只使用前33个关键点, 其余为辅助点.

use anyhow::{bail, Result};
use image::imageops::{self, FilterType};
use ndarray::{Array, IxDyn};

use super::sigmoid;
use crate::config::ModelConfig;
use crate::types::{Frame, Landmark, PoseResult};
use crate::OrtBackend;

const VALUES_PER_LANDMARK: usize = 5;

/// 关键点解码器
#[derive(Debug, Clone)]
pub struct LandmarkDecoder {
    pub nk: usize,
    pub conf: f32,
    pub kconf: f32,
    pub input_size: u32,
}

impl LandmarkDecoder {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            nk: config.nk,
            conf: config.conf,
            kconf: config.kconf,
            input_size: config.input_size,
        }
    }

    pub fn decode(
        &self,
        landmarks: &Array<f32, IxDyn>,
        presence: Option<&Array<f32, IxDyn>>,
    ) -> Result<PoseResult> {
        let values: Vec<f32> = landmarks.iter().copied().collect();
        if values.len() < self.nk * VALUES_PER_LANDMARK {
            bail!(
                "landmark output has {} values, expected at least {} for {} keypoints",
                values.len(),
                self.nk * VALUES_PER_LANDMARK,
                self.nk
            );
        }

        if let Some(score) = presence.and_then(|p| p.iter().next().copied()) {
            if sigmoid(score) < self.conf {
                return Ok(PoseResult::not_found());
            }
        }

        let size = self.input_size as f32;
        let lms: Vec<Landmark> = values
            .chunks_exact(VALUES_PER_LANDMARK)
            .take(self.nk)
            .map(|v| {
                Landmark::new(
                    (v[0] / size).clamp(0.0, 1.0),
                    (v[1] / size).clamp(0.0, 1.0),
                    v[2] / size,
                    sigmoid(v[3]),
                )
            })
            .collect();

        // 没有存在分数输出时, 以可见关键点判断是否有人
        if presence.is_none() && !lms.iter().any(|l| l.visibility >= self.kconf) {
            return Ok(PoseResult::not_found());
        }
        Ok(PoseResult::with_landmarks(lms))
    }
}

/// 关键点跟踪模型
pub struct LandmarkTracker {
    engine: OrtBackend,
    decoder: LandmarkDecoder,
}

impl LandmarkTracker {
    pub fn new(engine: OrtBackend, config: &ModelConfig) -> Self {
        Self {
            engine,
            decoder: LandmarkDecoder::new(config),
        }
    }

    pub fn preprocess(&self, frame: &Frame) -> Result<Array<f32, IxDyn>> {
        let Some(img) = frame.to_image() else {
            bail!(
                "frame {} buffer does not match {}x{}",
                frame.index,
                frame.width,
                frame.height
            );
        };
        let (w, h) = (self.engine.width(), self.engine.height());
        let img = imageops::resize(&img, w, h, FilterType::Triangle);

        let mut ys = Array::zeros((1, h as usize, w as usize, 3)).into_dyn();
        for (x, y, rgb) in img.enumerate_pixels() {
            for c in 0..3 {
                ys[[0, y as usize, x as usize, c]] = rgb.0[c] as f32 / 255.0;
            }
        }
        Ok(ys)
    }
}

impl super::PoseModel for LandmarkTracker {
    fn infer(&mut self, frame: &Frame) -> Result<PoseResult> {
        let xs = self.preprocess(frame)?;
        let ys = self.engine.run(xs)?;
        self.decoder.decode(&ys[0], ys.get(1))
    }

    fn num_keypoints(&self) -> usize {
        self.decoder.nk
    }

    fn summary(&self) {
        tracing::info!(
            "\nSummary:\n\
            > Model: landmark tracker\n\
            > EP: {:?}\n\
            > Input: {}x{}\n\
            > nk: {}, presence: {}, visibility: {}",
            self.engine.ep(),
            self.engine.width(),
            self.engine.height(),
            self.decoder.nk,
            self.decoder.conf,
            self.decoder.kconf,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> LandmarkDecoder {
        LandmarkDecoder {
            nk: 33,
            conf: 0.5,
            kconf: 0.5,
            input_size: 256,
        }
    }

    fn raw(n: usize, f: impl Fn(usize) -> [f32; 5]) -> Array<f32, IxDyn> {
        let values: Vec<f32> = (0..n).flat_map(f).collect();
        Array::from_shape_vec(IxDyn(&[1, n * 5]), values).unwrap()
    }

    #[test]
    fn test_landmarks_are_normalized_with_depth() {
        // 39 个点 (33 + 6 辅助点), 只保留前33
        let ys = raw(39, |i| [i as f32 * 4.0, 128.0, -25.6, 3.0, 3.0]);
        let presence = Array::from_elem(IxDyn(&[1, 1]), 4.0f32);

        let r = decoder().decode(&ys, Some(&presence)).unwrap();
        let lms = r.landmarks.unwrap();
        assert_eq!(lms.len(), 33);
        assert!((lms[0].x - 0.0).abs() < 1e-6);
        // (0, 0.5) 不是哨兵, 可见度保留
        assert!((lms[0].visibility - sigmoid(3.0)).abs() < 1e-4);
        assert!((lms[10].x - 40.0 / 256.0).abs() < 1e-4);
        assert!((lms[10].y - 0.5).abs() < 1e-4);
        assert!((lms[10].z + 0.1).abs() < 1e-4);
        assert!((lms[10].visibility - sigmoid(3.0)).abs() < 1e-4);
    }

    #[test]
    fn test_low_presence_is_not_found() {
        let ys = raw(33, |_| [10.0, 10.0, 0.0, 3.0, 3.0]);
        let presence = Array::from_elem(IxDyn(&[1, 1]), -4.0f32);
        let r = decoder().decode(&ys, Some(&presence)).unwrap();
        assert_eq!(r, PoseResult::not_found());
    }

    #[test]
    fn test_invisible_without_presence_is_not_found() {
        let ys = raw(33, |_| [10.0, 10.0, 0.0, -6.0, 0.0]);
        assert!(!decoder().decode(&ys, None).unwrap().found);
    }

    #[test]
    fn test_short_output_is_rejected() {
        let ys = raw(10, |_| [0.0; 5]);
        assert!(decoder().decode(&ys, None).is_err());
    }
}
