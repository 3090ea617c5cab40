/// 姿态推流数据结构定义
/// Data structures shared by the capture, inference and publishing stages
use chrono::{DateTime, Utc};
use serde::Serialize;

// ========== 帧 ==========

/// 已解码帧 (解码线程 → 推理), 紧凑 RGB24
#[derive(Clone)]
pub struct Frame {
    pub index: u64, // 帧序号 (每个源从0开始)
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>, // width * height * 3
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(index: u64, width: u32, height: u32, data: Vec<u8>) -> Self {
        Self {
            index,
            width,
            height,
            data,
            captured_at: Utc::now(),
        }
    }

    /// 纯色帧 (测试与预热用)
    pub fn filled(index: u64, width: u32, height: u32, value: u8) -> Self {
        Self::new(
            index,
            width,
            height,
            vec![value; (width * height * 3) as usize],
        )
    }

    pub fn to_image(&self) -> Option<image::RgbImage> {
        image::RgbImage::from_raw(self.width, self.height, self.data.clone())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("index", &self.index)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

// ========== 推送结果 ==========

/// 单个关键点 (归一化坐标)
///
/// 字段顺序即线上 JSON 的键顺序: x, y, z, visibility
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Landmark {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub visibility: f32,
}

impl Landmark {
    /// 构造关键点; (0,0) 表示"未计算", 可见度强制为 0
    pub fn new(x: f32, y: f32, z: f32, visibility: f32) -> Self {
        let visibility = if x == 0.0 && y == 0.0 {
            0.0
        } else {
            visibility.clamp(0.0, 1.0)
        };
        Self {
            x,
            y,
            z,
            visibility,
        }
    }
}

/// 一帧的姿态结果: 最多一个人
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PoseResult {
    pub found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<Vec<Landmark>>,
}

impl PoseResult {
    pub fn not_found() -> Self {
        Self::default()
    }

    pub fn with_landmarks(landmarks: Vec<Landmark>) -> Self {
        Self {
            found: true,
            landmarks: Some(landmarks),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ========== 检测中间结果 ==========

#[derive(Debug, PartialEq, Clone, Default)]
pub struct Point2 {
    // A point2d with x, y, conf
    x: f32,
    y: f32,
    confidence: f32,
}

impl Point2 {
    pub fn new_with_conf(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    pub fn x(&self) -> f32 {
        self.x
    }

    pub fn y(&self) -> f32 {
        self.y
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Bbox {
    // a bounding box around a person, in original-frame pixels
    xmin: f32,
    ymin: f32,
    width: f32,
    height: f32,
    confidence: f32,
}

impl Bbox {
    pub fn new(xmin: f32, ymin: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            xmin,
            ymin,
            width,
            height,
            confidence,
        }
    }

    pub fn xmin(&self) -> f32 {
        self.xmin
    }

    pub fn ymin(&self) -> f32 {
        self.ymin
    }

    pub fn xmax(&self) -> f32 {
        self.xmin + self.width
    }

    pub fn ymax(&self) -> f32 {
        self.ymin + self.height
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn area(&self) -> f32 {
        self.width * self.height
    }

    pub fn intersection_area(&self, another: &Bbox) -> f32 {
        let l = self.xmin.max(another.xmin);
        let r = self.xmax().min(another.xmax());
        let t = self.ymin.max(another.ymin);
        let b = self.ymax().min(another.ymax());
        (r - l).max(0.) * (b - t).max(0.)
    }

    pub fn iou(&self, another: &Bbox) -> f32 {
        let inter = self.intersection_area(another);
        let union = self.area() + another.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}
