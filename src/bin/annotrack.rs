// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
/// 标注跟踪工具 (Annotation Tracker)
///
/// 对图片目录中的帧序列进行目标跟踪:
/// - track:     单目标区间跟踪, 输出JSON
/// - track-all: 多目标 NORMAL (+ APPEND) 跟踪, 输出JSON
/// - preview:   多目标跟踪后合成轨迹预览图
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use annotrack::pipeline::{JobOutput, JobQueue, JobRequest};
use annotrack::{
    gen_time_string, BBox, BackendKind, BatchOutcome, DirectoryFrameSource, FrameSource, ObjectId,
    Quality, SessionStore, TrackerConfig, TrackingService,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "标注跟踪工具 - multi-frame object tracking", long_about = None)]
struct Cli {
    /// 帧目录 (按文件名排序)
    #[arg(short, long)]
    frames: PathBuf,

    /// 配置文件, 不存在时写入默认配置
    #[arg(short, long, default_value = "annotrack.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 单目标区间跟踪
    Track {
        #[arg(long, default_value_t = 0)]
        object_id: ObjectId,
        #[arg(long)]
        start: u32,
        #[arg(long)]
        end: u32,
        /// x1,y1,x2,y2
        #[arg(long)]
        bbox: BBox,
        /// local / siamese (csrt / pysot 也可)
        #[arg(long)]
        backend: Option<BackendKind>,
    },
    /// 多目标跟踪
    TrackAll {
        #[command(flatten)]
        batch: BatchArgs,
        /// 输出JSON文件, 缺省输出到标准输出
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// 多目标跟踪后合成预览图
    Preview {
        #[command(flatten)]
        batch: BatchArgs,
        /// 焦点目标
        #[arg(long)]
        focus: ObjectId,
        /// 焦点目标的轨迹点序号
        #[arg(long, default_value_t = 0)]
        index: usize,
        /// 底图帧号
        #[arg(long)]
        base: u32,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// id:x1,y1,x2,y2 (可重复)
    #[arg(long = "object", required = true, value_parser = parse_object)]
    objects: Vec<(ObjectId, BBox)>,
    #[arg(long, default_value_t = 0)]
    start: u32,
    /// NORMAL 跟踪帧数
    #[arg(long, default_value_t = 20)]
    frames_to_track: u32,
    /// 之后继续 APPEND 的帧数
    #[arg(long)]
    append: Option<u32>,
    /// 每个任务的超时秒数
    #[arg(long)]
    timeout: Option<u64>,
}

fn parse_object(s: &str) -> std::result::Result<(ObjectId, BBox), String> {
    let (id, bbox) = s
        .split_once(':')
        .ok_or_else(|| format!("expected id:x1,y1,x2,y2, got `{s}`"))?;
    let id = id.trim().parse().map_err(|e| format!("object id `{id}`: {e}"))?;
    let bbox = bbox.parse().map_err(|e| format!("{e}"))?;
    Ok((id, bbox))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = TrackerConfig::load(&cli.config);
    let frames = DirectoryFrameSource::open(&cli.frames)
        .with_context(|| format!("open frame directory {}", cli.frames.display()))?
        .with_compressed_quality(config.jpeg_quality);
    info!("🎞️ {} frames in {}", frames.frame_count(), cli.frames.display());

    let service = Arc::new(
        TrackingService::new(config, Arc::new(frames), Arc::new(SessionStore::new()))
            .context("invalid tracker config")?,
    );

    match cli.command {
        Command::Track {
            object_id,
            start,
            end,
            bbox,
            backend,
        } => {
            let backend = backend.unwrap_or(service.config().range_backend);
            let range = service.track_range(object_id, start, end, bbox, backend)?;
            println!("{}", serde_json::to_string_pretty(&range)?);
        }
        Command::TrackAll { batch, output } => {
            let outcomes = run_batch(&service, &batch)?;
            let json = serde_json::to_string_pretty(&outcomes)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("write {}", path.display()))?;
                    info!("✅ results written to {}", path.display());
                }
                None => println!("{json}"),
            }
        }
        Command::Preview {
            batch,
            focus,
            index,
            base,
            output,
        } => {
            run_batch(&service, &batch)?;
            let image = service.read_composite(focus, index, base, Quality::Compressed)?;
            let path = output
                .unwrap_or_else(|| PathBuf::from(format!("preview_{}.jpg", gen_time_string("_"))));
            std::fs::write(&path, &image.bytes)
                .with_context(|| format!("write {}", path.display()))?;
            info!("✅ preview ({}) written to {}", image.mime, path.display());
        }
    }
    Ok(())
}

/// NORMAL, 可选 APPEND; 通过任务队列执行以支持超时
fn run_batch(service: &Arc<TrackingService>, args: &BatchArgs) -> Result<serde_json::Value> {
    let queue = JobQueue::new(Arc::clone(service), 1);
    let timeout = args.timeout.map(Duration::from_secs);
    let wait = |request: JobRequest| -> Result<BatchOutcome> {
        let handle = queue.submit(request);
        let output = match timeout {
            Some(t) => handle.wait_timeout(t)?,
            None => handle.wait()?,
        };
        match output {
            JobOutput::Batch(outcome) => Ok(outcome),
            JobOutput::Range(_) => anyhow::bail!("unexpected range output"),
        }
    };

    let normal = wait(JobRequest::Normal {
        objects: args.objects.clone(),
        frame_start: args.start,
        frames_to_track: args.frames_to_track,
    })?;
    let mut report = json!({
        "range": service.range(),
        "normal": outcome_json(&normal),
    });

    if let Some(frames_to_track) = args.append {
        let append = wait(JobRequest::Append {
            object_ids: args.objects.iter().map(|(id, _)| *id).collect(),
            frames_to_track,
        })?;
        report["append"] = outcome_json(&append);
        report["range"] = json!(service.range());
    }
    Ok(report)
}

fn outcome_json(outcome: &BatchOutcome) -> serde_json::Value {
    let tracks: serde_json::Map<String, serde_json::Value> = outcome
        .tracks
        .iter()
        .map(|(id, track)| (id.to_string(), json!(track)))
        .collect();
    let failures: serde_json::Map<String, serde_json::Value> = outcome
        .failures
        .iter()
        .map(|(id, e)| (id.to_string(), json!(e.to_string())))
        .collect();
    json!({ "tracks": tracks, "failures": failures })
}
