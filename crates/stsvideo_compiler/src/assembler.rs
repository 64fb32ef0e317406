//! Command Assembler (§4.8): turns a `TimelinePlan` into a concrete
//! ffmpeg argument vector, spawns the encoder, and streams its stderr as
//! progress updates. Grounded on `forgecut_render::render`'s
//! `build_ffmpeg_args`/`execute`/`parse_progress` — the structure and the
//! `\r`-delimited stderr parsing carry over unchanged; what changes is the
//! input vector, which here comes from `timeline::TimelinePlan::inputs`
//! (`-loop`/`-t` for stills and rasterized overlays) rather than a flat
//! list of `-i <path>`.

use crate::cancel::CancellationToken;
use crate::error::{CompileError, Result};
use crate::timeline::{InputSlotKind, TimelinePlan};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One resolved `-i` argument, serialized alongside the plan for `--dry-run`
/// inspection (§9 supplemented feature: a `RenderPlan` a caller can print or
/// save without invoking the encoder).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderInputSpec {
    pub path: PathBuf,
    pub loop_still: bool,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderPlan {
    pub inputs: Vec<RenderInputSpec>,
    pub filter_graph: String,
    pub output_path: PathBuf,
    pub encoder_args: Vec<String>,
}

/// Progress update streamed from the encoder's stderr during `execute`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncodeProgress {
    pub percent: f64,
    pub frame: u64,
    pub fps: f64,
    pub speed: String,
    pub eta_seconds: Option<f64>,
}

fn encoder_args(ffmpeg_preset: Option<&str>, dev_mode: bool) -> Vec<String> {
    let mut args = vec!["-pix_fmt".to_string(), "yuv420p".to_string()];
    if let Some(preset) = ffmpeg_preset {
        args.extend(preset.split_whitespace().map(str::to_string));
    } else if dev_mode {
        args.extend(["-preset".to_string(), "ultrafast".to_string()]);
    } else {
        args.extend(["-preset".to_string(), "medium".to_string()]);
    }
    args.extend([
        "-c:a".to_string(),
        "aac".to_string(),
        "-b:a".to_string(),
        "192k".to_string(),
    ]);
    args
}

/// Builds a `RenderPlan` from a compiled timeline. `ffmpeg_preset` is the
/// resolved preset argument string (from the project's `ffmpeg` block), if
/// any; `dev_mode` applies the `-preset ultrafast` override when no
/// explicit preset was given.
pub fn build_plan(
    plan: &TimelinePlan,
    output_path: PathBuf,
    ffmpeg_preset: Option<&str>,
    dev_mode: bool,
) -> RenderPlan {
    let inputs = plan
        .inputs
        .iter()
        .map(|slot| match slot {
            InputSlotKind::Direct { path } => RenderInputSpec {
                path: path.clone(),
                loop_still: false,
                duration_ms: None,
            },
            InputSlotKind::Looped { path, duration_ms } => RenderInputSpec {
                path: path.clone(),
                loop_still: true,
                duration_ms: Some(*duration_ms),
            },
        })
        .collect();

    RenderPlan {
        inputs,
        filter_graph: plan.filter_graph.clone(),
        output_path,
        encoder_args: encoder_args(ffmpeg_preset, dev_mode),
    }
}

/// Builds the full ffmpeg argument vector per §4.8: global flags, inputs in
/// stable-index order, the filter graph, output mapping, encoder args, and
/// the output path.
pub fn build_args(plan: &RenderPlan) -> Vec<String> {
    let mut args = vec!["-y".to_string(), "-v".to_string(), "error".to_string()];

    for input in &plan.inputs {
        if input.loop_still {
            args.push("-loop".to_string());
            args.push("1".to_string());
            let duration_s = input.duration_ms.unwrap_or(0) as f64 / 1000.0;
            args.push("-t".to_string());
            args.push(format!("{duration_s:.3}"));
        }
        args.push("-i".to_string());
        args.push(input.path.to_string_lossy().to_string());
    }

    args.push("-filter_complex".to_string());
    args.push(plan.filter_graph.clone());
    args.push("-map".to_string());
    args.push("[outv]".to_string());
    args.push("-map".to_string());
    args.push("[outa]".to_string());
    args.extend(plan.encoder_args.clone());
    args.push(plan.output_path.to_string_lossy().to_string());

    args
}

/// Spawns the encoder, streaming parsed progress through `progress_tx`
/// until the process exits. Observes `token` at each stderr read so an
/// external cancellation terminates the child promptly.
pub async fn execute(
    plan: &RenderPlan,
    total_duration_ms: i64,
    progress_tx: tokio::sync::watch::Sender<EncodeProgress>,
    token: &CancellationToken,
) -> Result<()> {
    use std::process::Stdio;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::process::Command;

    let args = build_args(plan);

    let mut child = Command::new("ffmpeg")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CompileError::EncoderNotFound
            } else {
                CompileError::Io(e)
            }
        })?;

    let stderr = child.stderr.take().expect("stderr was piped");
    let mut reader = BufReader::new(stderr);
    let total_secs = total_duration_ms as f64 / 1000.0;

    let mut buf = Vec::new();
    loop {
        if token.is_cancelled() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(CompileError::Cancelled);
        }

        buf.clear();
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(CompileError::Cancelled);
            }
            n = reader.read_until(b'\r', &mut buf) => n.map_err(CompileError::Io)?,
        };
        if read == 0 {
            break;
        }
        let chunk = String::from_utf8_lossy(&buf);
        for segment in chunk.split(['\r', '\n']) {
            if let Some(progress) = parse_progress(segment.trim(), total_secs) {
                let _ = progress_tx.send(progress);
            }
        }
    }

    let status = child.wait().await.map_err(CompileError::Io)?;
    if !status.success() {
        let tail = format!("ffmpeg exited with {status}");
        return Err(CompileError::EncoderFailed {
            exit_code: status.code().unwrap_or(-1),
            tail,
        });
    }

    Ok(())
}

/// Parses one ffmpeg stderr progress line, e.g.
/// `frame=  123 fps= 60 ... time=00:01:02.05 speed=1.50x`.
fn parse_progress(line: &str, total_secs: f64) -> Option<EncodeProgress> {
    if !line.contains("time=") {
        return None;
    }

    let frame = extract_value(line, "frame=")
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);
    let fps = extract_value(line, "fps=")
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0);
    let speed_str = extract_value(line, "speed=").unwrap_or_default();
    let time_secs = extract_value(line, "time=")
        .and_then(|v| parse_time_str(&v))
        .unwrap_or(0.0);

    let percent = if total_secs > 0.0 {
        (time_secs / total_secs * 100.0).min(100.0)
    } else {
        0.0
    };

    let speed_factor = speed_str.trim_end_matches('x').parse::<f64>().unwrap_or(0.0);
    let eta_seconds = if speed_factor > 0.0 && total_secs > time_secs {
        Some((total_secs - time_secs) / speed_factor)
    } else {
        None
    };

    Some(EncodeProgress {
        percent,
        frame,
        fps,
        speed: speed_str,
        eta_seconds,
    })
}

fn extract_value(line: &str, key: &str) -> Option<String> {
    let start = line.find(key)? + key.len();
    let rest = &line[start..];
    let trimmed = rest.trim_start();
    let end = trimmed.find(|c: char| c.is_whitespace()).unwrap_or(trimmed.len());
    let val = trimmed[..end].to_string();
    if val.is_empty() {
        None
    } else {
        Some(val)
    }
}

fn parse_time_str(s: &str) -> Option<f64> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: f64 = parts[0].parse().ok()?;
    let mins: f64 = parts[1].parse().ok()?;
    let secs: f64 = parts[2].parse().ok()?;
    Some(hours * 3600.0 + mins * 60.0 + secs)
}
