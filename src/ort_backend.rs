// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//
// ONNX Runtime 推理后端
// 负责: 会话构建 (CPU / CUDA / TensorRT)、单次前向推理

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ndarray::{Array, IxDyn};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
    TensorRTExecutionProvider,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use tracing::{info, warn};

/// 模型任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum YOLOTask {
    Classify,
    Detect,
    Pose,
    Segment,
}

/// 推理执行器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrtEP {
    CPU,
    CUDA(i32),
    Trt(i32),
}

impl OrtEP {
    /// `strict`: 只注册指定执行器, 注册失败即报错
    fn providers(
        &self,
        fp16: bool,
        cache: Option<&PathBuf>,
        strict: bool,
    ) -> Vec<ExecutionProviderDispatch> {
        match *self {
            OrtEP::CPU => vec![CPUExecutionProvider::default().build()],
            OrtEP::CUDA(id) if strict => vec![CUDAExecutionProvider::default()
                .with_device_id(id)
                .build()
                .error_on_failure()],
            OrtEP::CUDA(id) => vec![
                CUDAExecutionProvider::default().with_device_id(id).build(),
                CPUExecutionProvider::default().build(),
            ],
            OrtEP::Trt(id) => {
                let mut trt = TensorRTExecutionProvider::default()
                    .with_device_id(id)
                    .with_fp16(fp16);
                if let Some(dir) = cache {
                    trt = trt
                        .with_engine_cache(true)
                        .with_engine_cache_path(dir.display().to_string());
                }
                if strict {
                    return vec![trt.build().error_on_failure()];
                }
                // TensorRT 不支持的算子回退到 CUDA, 再回退 CPU
                vec![
                    trt.build(),
                    CUDAExecutionProvider::default().with_device_id(id).build(),
                    CPUExecutionProvider::default().build(),
                ]
            }
        }
    }
}

/// 后端构建参数
#[derive(Debug, Clone)]
pub struct OrtConfig {
    pub f: String,
    pub ep: OrtEP,
    pub task: YOLOTask,
    pub trt_fp16: bool,
    pub trt_cache: Option<PathBuf>,
    pub strict_ep: bool,
    pub image_size: (u32, u32), // (height, width)
}

/// ONNX Runtime 会话封装 (不可重入, 调用方负责串行化)
pub struct OrtBackend {
    session: Session,
    ep: OrtEP,
    height: u32,
    width: u32,
    input_name: String,
    output_names: Vec<String>,
}

impl OrtBackend {
    pub fn build(args: OrtConfig) -> Result<Self> {
        if !Path::new(&args.f).exists() {
            anyhow::bail!("model file not found: {}", args.f);
        }
        if let Some(dir) = &args.trt_cache {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create engine cache {}", dir.display()))?;
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_execution_providers(args.ep.providers(
                args.trt_fp16,
                args.trt_cache.as_ref(),
                args.strict_ep,
            ))?
            .commit_from_file(&args.f)
            .with_context(|| format!("failed to load ONNX model {}", args.f))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .context("model has no inputs")?;
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        if output_names.is_empty() {
            anyhow::bail!("model has no outputs");
        }

        if !args.strict_ep && !matches!(args.ep, OrtEP::CPU) {
            warn!("⚙️ 执行器 {:?} 不可用时会静默回退到 CPU", args.ep);
        }
        info!(
            "✅ 模型加载成功: {} | {:?} | EP: {:?} | 输入 {} ({}x{}) | 输出 {:?}",
            args.f,
            args.task,
            args.ep,
            input_name,
            args.image_size.1,
            args.image_size.0,
            output_names
        );

        Ok(Self {
            session,
            ep: args.ep,
            height: args.image_size.0,
            width: args.image_size.1,
            input_name,
            output_names,
        })
    }

    /// 前向推理: NCHW 张量 → 所有输出 (按模型声明顺序)
    pub fn run(&mut self, xs: Array<f32, IxDyn>) -> Result<Vec<Array<f32, IxDyn>>> {
        let input = Tensor::from_array(xs)?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => input])
            .context("inference failed")?;

        let mut ys = Vec::with_capacity(self.output_names.len());
        for name in &self.output_names {
            let y = outputs[name.as_str()]
                .try_extract_array::<f32>()
                .with_context(|| format!("failed to extract output {}", name))?;
            ys.push(y.to_owned());
        }
        Ok(ys)
    }

    pub fn ep(&self) -> &OrtEP {
        &self.ep
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn width(&self) -> u32 {
        self.width
    }
}

/// 列出缓存目录中的 TensorRT 引擎文件 (`*.engine`)
pub fn cached_engines(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut engines = vec![];
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "engine") {
            engines.push(path);
        }
    }
    engines.sort();
    Ok(engines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_trt_has_no_fallback() {
        let ep = OrtEP::Trt(0);
        assert_eq!(ep.providers(true, None, false).len(), 3);
        assert_eq!(ep.providers(true, None, true).len(), 1);

        let ep = OrtEP::CUDA(0);
        assert_eq!(ep.providers(false, None, false).len(), 2);
        assert_eq!(ep.providers(false, None, true).len(), 1);
    }

    #[test]
    fn test_cached_engines_lists_engine_files_only() {
        let dir = std::env::temp_dir().join(format!("pose-engine-cache-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        assert!(cached_engines(&dir).unwrap().is_empty());

        std::fs::write(dir.join("TensorrtExecutionProvider_cache.profile"), b"p").unwrap();
        std::fs::write(dir.join("TensorrtExecutionProvider_model_fp16.engine"), b"e").unwrap();
        std::fs::create_dir_all(dir.join("nested.engine")).unwrap();

        let engines = cached_engines(&dir).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
        assert_eq!(engines.len(), 1);
        assert!(engines[0].ends_with("TensorrtExecutionProvider_model_fp16.engine"));
    }

    #[test]
    fn test_missing_cache_dir_is_error() {
        let dir = std::env::temp_dir().join("pose-engine-cache-missing-dir");
        assert!(cached_engines(&dir).is_err());
    }

    #[test]
    fn test_missing_model_file() {
        let err = OrtBackend::build(OrtConfig {
            f: "no/such/model.onnx".into(),
            ep: OrtEP::CPU,
            task: YOLOTask::Pose,
            trt_fp16: false,
            trt_cache: None,
            strict_ep: false,
            image_size: (640, 640),
        })
        .err()
        .unwrap();
        assert!(err.to_string().contains("model file not found"));
    }
}
