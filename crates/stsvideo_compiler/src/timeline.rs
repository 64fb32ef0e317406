//! Timeline Compiler (§4.7). Resolves every fragment's timing across all
//! sequences, assigns stable input indices, and walks each sequence to
//! build per-fragment streams, join them (concat/xfade), overlay z-indexed
//! fragments onto the sequence base, then compose sequences together.

use crate::dag::{self, FadeDirection, Filter, Label, Stream, StreamDag};
use crate::error::{CompileError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use stsvideo_core::expr::{self, CompiledExpression, ExpressionContext, FragmentData};
use stsvideo_core::types::*;
use stsvideo_core::CoreError;

/// One entry of the `-i` argument vector, in stable input-index order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InputSlotKind {
    /// A regular media asset: `-i <path>`.
    Direct { path: PathBuf },
    /// A still image or rasterized overlay PNG: `-loop 1 -t <s> -i <path>`.
    Looped { path: PathBuf, duration_ms: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelinePlan {
    pub filter_graph: String,
    pub inputs: Vec<InputSlotKind>,
}

pub fn compile(project: &Project, output: &Output) -> Result<TimelinePlan> {
    let (resolved, _ctx) = resolve_timings(project)?;
    validate_resolved(project, &resolved)?;

    let order = assign_input_indices(project);
    let index_map: HashMap<InputKey, usize> =
        order.iter().cloned().enumerate().map(|(i, k)| (k, i)).collect();
    let needed = compute_needed_ms(project, &resolved);
    let inputs = build_inputs(project, &order, &needed)?;

    let mut dag = StreamDag::new();
    let mut seq_results = Vec::with_capacity(project.sequences.len());
    for seq in &project.sequences {
        seq_results.push(compile_sequence(&mut dag, project, output, seq, &resolved, &index_map)?);
    }

    let mut final_video: Option<Stream> = None;
    let mut audio_streams: Vec<Stream> = Vec::new();
    for (video, audio) in seq_results {
        if let Some(v) = video {
            final_video = Some(match final_video.take() {
                None => v,
                Some(base) => base.overlay(&mut dag, &v, "0", "0", None),
            });
        }
        if let Some(a) = audio {
            audio_streams.push(a);
        }
    }

    match final_video {
        Some(v) => v.end_to(&mut dag, "outv"),
        None => {
            return Err(CompileError::InvalidFilterInputs {
                filter_name: "graph".to_string(),
                details: "no sequence produced a video stream".to_string(),
            })
        }
    }

    let final_audio = match audio_streams.len() {
        0 => None,
        1 => audio_streams.into_iter().next(),
        _ => Some(dag::make_amix(&mut dag, &audio_streams)?),
    };
    match final_audio {
        Some(a) => a.end_to(&mut dag, "outa"),
        None => push_silent_audio(&mut dag),
    }

    Ok(TimelinePlan {
        filter_graph: dag.render(),
        inputs,
    })
}

fn push_silent_audio(dag: &mut StreamDag) {
    dag.push(Filter {
        inputs: vec![],
        outputs: vec![Label {
            tag: "outa".to_string(),
            is_audio: true,
        }],
        name: "anullsrc".to_string(),
        params: vec![
            ("r".to_string(), "48000".to_string()),
            ("cl".to_string(), "stereo".to_string()),
        ],
    });
}

// ---------------------------------------------------------------------------
// Stable input index assignment (§3 invariant 5)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum InputKey {
    Asset(String),
    Container(String),
    App(String),
}

fn fragment_key(frag: &FragmentSpec) -> InputKey {
    match &frag.target {
        FragmentTarget::Asset(name) => InputKey::Asset(name.clone()),
        FragmentTarget::Container(id) => InputKey::Container(id.clone()),
        FragmentTarget::App(id) => InputKey::App(id.clone()),
    }
}

fn assign_input_indices(project: &Project) -> Vec<InputKey> {
    let mut order = Vec::new();
    let mut seen = HashSet::new();
    for seq in &project.sequences {
        for frag in &seq.fragments {
            if !frag.enabled {
                continue;
            }
            let key = fragment_key(frag);
            if seen.insert(key.clone()) {
                order.push(key);
            }
        }
    }
    order
}

fn compute_needed_ms(project: &Project, resolved: &HashMap<String, FragmentResolved>) -> HashMap<InputKey, i64> {
    let mut needed: HashMap<InputKey, i64> = HashMap::new();
    for seq in &project.sequences {
        for frag in &seq.fragments {
            if !frag.enabled {
                continue;
            }
            let r = &resolved[&frag.id];
            let need = frag.trim_start_ms + r.duration_ms;
            let entry = needed.entry(fragment_key(frag)).or_insert(0);
            if need > *entry {
                *entry = need;
            }
        }
    }
    needed
}

fn build_inputs(
    project: &Project,
    order: &[InputKey],
    needed: &HashMap<InputKey, i64>,
) -> Result<Vec<InputSlotKind>> {
    order
        .iter()
        .map(|key| match key {
            InputKey::Asset(name) => {
                let asset = &project.assets[name];
                if asset.kind == AssetKind::Image {
                    Ok(InputSlotKind::Looped {
                        path: asset.path.clone(),
                        duration_ms: *needed.get(key).unwrap_or(&0),
                    })
                } else {
                    Ok(InputSlotKind::Direct { path: asset.path.clone() })
                }
            }
            InputKey::Container(id) => {
                let container = project.containers.get(id).ok_or_else(|| CompileError::UnknownReference {
                    fragment_id: id.clone(),
                    target_name: id.clone(),
                })?;
                let png = container.png_path.clone().ok_or_else(|| CompileError::ContainerRenderFailed {
                    container_id: id.clone(),
                    message: "no rasterized PNG available for this output".to_string(),
                })?;
                Ok(InputSlotKind::Looped {
                    path: png,
                    duration_ms: *needed.get(key).unwrap_or(&0),
                })
            }
            InputKey::App(id) => {
                let app = project.apps.get(id).ok_or_else(|| CompileError::UnknownReference {
                    fragment_id: id.clone(),
                    target_name: id.clone(),
                })?;
                let png = app.png_path.clone().ok_or_else(|| CompileError::ContainerRenderFailed {
                    container_id: id.clone(),
                    message: "no rasterized PNG available for this output".to_string(),
                })?;
                Ok(InputSlotKind::Looped {
                    path: png,
                    duration_ms: *needed.get(key).unwrap_or(&0),
                })
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Fragment timing resolution (§4.2 resolution discipline, §4.7.1)
// ---------------------------------------------------------------------------

fn duration_expr(d: &DurationSpec) -> Option<&CompiledExpression> {
    match d {
        DurationSpec::Expr(e) => Some(e),
        DurationSpec::UntilEnd(EndBound::Expr(e)) => Some(e),
        _ => None,
    }
}

fn start_expr(s: &StartSpec) -> Option<&CompiledExpression> {
    match s {
        StartSpec::Expr(e) => Some(e),
        _ => None,
    }
}

fn check_known_refs(expr_opt: Option<&CompiledExpression>, known_ids: &HashSet<String>) -> Result<()> {
    if let Some(e) = expr_opt {
        for id in e.referenced_fragment_ids() {
            if !known_ids.contains(id) {
                return Err(CompileError::Core(CoreError::UnknownReference {
                    fragment_id: id.to_string(),
                    target_name: "time".to_string(),
                }));
            }
        }
    }
    Ok(())
}

fn all_deps_resolved(e: &CompiledExpression, ctx: &ExpressionContext) -> bool {
    e.referenced_fragment_ids().all(|id| ctx.fragments.contains_key(id))
}

fn source_duration_ms(frag: &FragmentSpec, project: &Project) -> Result<i64> {
    match &frag.target {
        FragmentTarget::Asset(name) => Ok(project.assets[name].duration_ms.0),
        _ => Err(CompileError::InvalidFragmentTarget {
            fragment_id: frag.id.clone(),
            detail: "container/app fragments cannot use a percentage duration".to_string(),
        }),
    }
}

fn try_resolve(
    frag: &FragmentSpec,
    project: &Project,
    prev_end: Option<i64>,
    ctx: &ExpressionContext,
) -> Result<Option<FragmentResolved>> {
    let start_ms = match &frag.start {
        StartSpec::Auto => prev_end.map(|p| p + frag.overlap_left_ms),
        StartSpec::Literal(v) => Some(*v),
        StartSpec::Expr(e) => {
            if all_deps_resolved(e, ctx) {
                Some(expr::evaluate(e, ctx)?.round() as i64)
            } else {
                None
            }
        }
    };
    let Some(start_ms) = start_ms else {
        return Ok(None);
    };

    let duration_ms = match &frag.duration {
        DurationSpec::Literal(v) => Some(*v),
        DurationSpec::FullSource => Some(source_duration_ms(frag, project)? - frag.trim_start_ms),
        DurationSpec::Expr(e) => {
            if all_deps_resolved(e, ctx) {
                Some(expr::evaluate(e, ctx)?.round() as i64)
            } else {
                None
            }
        }
        DurationSpec::UntilEnd(bound) => {
            let end_ms = match bound {
                EndBound::Literal(v) => Some(*v),
                EndBound::Expr(e) => {
                    if all_deps_resolved(e, ctx) {
                        Some(expr::evaluate(e, ctx)?.round() as i64)
                    } else {
                        None
                    }
                }
            };
            end_ms.map(|e| e - start_ms)
        }
    };
    let Some(duration_ms) = duration_ms else {
        return Ok(None);
    };

    Ok(Some(FragmentResolved {
        start_ms,
        duration_ms,
        end_ms: start_ms + duration_ms,
    }))
}

fn resolve_timings(project: &Project) -> Result<(HashMap<String, FragmentResolved>, ExpressionContext)> {
    let known_ids: HashSet<String> = project
        .sequences
        .iter()
        .flat_map(|s| s.fragments.iter().map(|f| f.id.clone()))
        .collect();

    for seq in &project.sequences {
        for frag in &seq.fragments {
            check_known_refs(duration_expr(&frag.duration), &known_ids)?;
            check_known_refs(start_expr(&frag.start), &known_ids)?;
        }
    }

    let mut resolved: HashMap<String, FragmentResolved> = HashMap::new();
    let mut ctx = ExpressionContext::new();

    loop {
        let mut progressed = false;
        for seq in &project.sequences {
            let mut prev_end = Some(0i64);
            for frag in &seq.fragments {
                if !frag.enabled {
                    continue;
                }
                if let Some(r) = resolved.get(&frag.id) {
                    prev_end = Some(r.end_ms);
                    continue;
                }
                match try_resolve(frag, project, prev_end, &ctx)? {
                    Some(r) => {
                        ctx.insert(
                            frag.id.clone(),
                            FragmentData {
                                start: r.start_ms as f64,
                                end: r.end_ms as f64,
                                duration: r.duration_ms as f64,
                            },
                        );
                        resolved.insert(frag.id.clone(), r);
                        progressed = true;
                        prev_end = Some(r.end_ms);
                    }
                    None => prev_end = None,
                }
            }
        }
        if !progressed {
            break;
        }
    }

    let total = project
        .sequences
        .iter()
        .flat_map(|s| s.fragments.iter())
        .filter(|f| f.enabled)
        .count();
    if resolved.len() < total {
        let remaining: Vec<String> = project
            .sequences
            .iter()
            .flat_map(|s| s.fragments.iter())
            .filter(|f| f.enabled && !resolved.contains_key(&f.id))
            .map(|f| f.id.clone())
            .collect();
        return Err(CompileError::UnresolvableExpression(remaining));
    }

    Ok((resolved, ctx))
}

fn validate_resolved(project: &Project, resolved: &HashMap<String, FragmentResolved>) -> Result<()> {
    for seq in &project.sequences {
        for frag in &seq.fragments {
            if !frag.enabled {
                continue;
            }
            let r = &resolved[&frag.id];
            if r.start_ms < 0 || r.duration_ms <= 0 {
                return Err(CompileError::DurationOverflow {
                    fragment_id: frag.id.clone(),
                    requested_ms: r.duration_ms,
                    available_ms: 0,
                });
            }
            if let FragmentTarget::Asset(name) = &frag.target {
                let asset = &project.assets[name];
                if asset.kind != AssetKind::Image {
                    let available = asset.duration_ms.0 - frag.trim_start_ms;
                    if r.duration_ms > available {
                        return Err(CompileError::DurationOverflow {
                            fragment_id: frag.id.clone(),
                            requested_ms: r.duration_ms,
                            available_ms: available,
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-fragment stream construction (§4.7.2)
// ---------------------------------------------------------------------------

fn apply_fit(dag: &mut StreamDag, stream: &Stream, w: u32, h: u32, fit: &ObjectFit) -> Stream {
    match fit {
        ObjectFit::Cover => stream.fit_cover(dag, w, h),
        ObjectFit::Contain(mode) => stream.fit_contain(dag, w, h, mode),
    }
}

fn build_video_stream(
    dag: &mut StreamDag,
    project: &Project,
    output: &Output,
    frag: &FragmentSpec,
    resolved: &FragmentResolved,
    index_map: &HashMap<InputKey, usize>,
) -> Result<Option<Stream>> {
    let idx = index_map[&fragment_key(frag)];
    match &frag.target {
        FragmentTarget::Asset(name) => {
            let asset = &project.assets[name];
            if !asset.has_video {
                return Ok(None);
            }
            let mut stream = Stream::from_input(idx, false);
            let needs_trim = frag.trim_start_ms != 0
                || (asset.kind != AssetKind::Image && resolved.duration_ms < asset.duration_ms.0);
            if needs_trim {
                stream = stream.trim(dag, frag.trim_start_ms, resolved.duration_ms);
            }
            stream = stream.transpose(dag, asset.rotation);
            stream = stream.fps(dag, output.fps);
            stream = apply_fit(dag, &stream, output.width, output.height, &frag.object_fit);
            if let Some(ck) = &frag.chromakey {
                stream = stream.colorkey(dag, &ck.color, ck.similarity, ck.blend);
            }
            if let Some(sigma) = frag.blur_sigma {
                stream = stream.gblur(dag, sigma);
            }
            stream = apply_transitions(dag, stream, frag, resolved);
            Ok(Some(stream))
        }
        FragmentTarget::Container(_) | FragmentTarget::App(_) => {
            let stream = Stream::from_input(idx, false);
            Ok(Some(apply_transitions(dag, stream, frag, resolved)))
        }
    }
}

fn apply_transitions(dag: &mut StreamDag, mut stream: Stream, frag: &FragmentSpec, resolved: &FragmentResolved) -> Stream {
    if let Some(t) = &frag.transition_in {
        stream = stream.fade(dag, FadeDirection::In, 0, t.duration_ms);
    }
    if let Some(t) = &frag.transition_out {
        let start = (resolved.duration_ms - t.duration_ms).max(0);
        stream = stream.fade(dag, FadeDirection::Out, start, t.duration_ms);
    }
    stream
}

fn build_audio_stream(
    dag: &mut StreamDag,
    project: &Project,
    frag: &FragmentSpec,
    resolved: &FragmentResolved,
    index_map: &HashMap<InputKey, usize>,
) -> Result<Option<Stream>> {
    let FragmentTarget::Asset(name) = &frag.target else {
        return Ok(None);
    };
    let asset = &project.assets[name];
    if !asset.has_audio {
        return Ok(None);
    }
    let idx = index_map[&fragment_key(frag)];
    let mut stream = Stream::from_input(idx, true);
    if frag.trim_start_ms != 0 || resolved.duration_ms < asset.duration_ms.0 {
        stream = stream.trim(dag, frag.trim_start_ms, resolved.duration_ms);
    }
    Ok(Some(stream))
}

// ---------------------------------------------------------------------------
// Joining and overlay compositing within one sequence (§4.7.3, §4.7.4)
// ---------------------------------------------------------------------------

/// Joins a whole run of consecutive zero/positive-overlap fragments that
/// share the same (video?, audio?) shape with a single `concat` filter
/// (§4.7.3: "one concat filter per run of consecutive zero-overlap
/// fragments, preferred for speed"), rather than folding the run pairwise.
///
/// This builds the flat input-label list directly from the streams in hand
/// instead of going through `dag::make_concat`'s run-length inference for
/// two of the three possible shapes: `make_concat` rejects a video-count of
/// zero outright (it reads the segment's leading run of non-audio labels to
/// find `v`, and errors if that run is empty), so an audio-only run can
/// never go through it. A video-only run has a video-only label list with
/// no audio labels to mark segment boundaries, which `make_concat`'s
/// inference would misread as one giant segment with `n` video outputs
/// instead of `n` one-output segments. Since the caller already knows every
/// segment's shape, both cases are built directly here; only the
/// video+audio shape (where `make_concat`'s inference is unambiguous) could
/// use it, but building the label list directly keeps all three shapes on
/// one code path.
fn push_concat_run(dag: &mut StreamDag, segs: Vec<(Option<Stream>, Option<Stream>)>) -> (Option<Stream>, Option<Stream>) {
    if segs.is_empty() {
        return (None, None);
    }
    if segs.len() == 1 {
        return segs.into_iter().next().unwrap();
    }

    let n = segs.len();
    match (segs[0].0.is_some(), segs[0].1.is_some()) {
        (true, true) => {
            let mut inputs = Vec::with_capacity(n * 2);
            for (v, a) in &segs {
                inputs.push(v.as_ref().unwrap().label().clone());
                inputs.push(a.as_ref().unwrap().label().clone());
            }
            let outv = dag.fresh_label(false);
            let outa = dag.fresh_label(true);
            dag.push(Filter {
                inputs,
                outputs: vec![outv.clone(), outa.clone()],
                name: "concat".to_string(),
                params: vec![
                    ("n".to_string(), n.to_string()),
                    ("v".to_string(), "1".to_string()),
                    ("a".to_string(), "1".to_string()),
                ],
            });
            (Some(Stream(outv)), Some(Stream(outa)))
        }
        (true, false) => {
            let inputs: Vec<Label> = segs.iter().map(|(v, _)| v.as_ref().unwrap().label().clone()).collect();
            let outv = dag.fresh_label(false);
            dag.push(Filter {
                inputs,
                outputs: vec![outv.clone()],
                name: "concat".to_string(),
                params: vec![
                    ("n".to_string(), n.to_string()),
                    ("v".to_string(), "1".to_string()),
                    ("a".to_string(), "0".to_string()),
                ],
            });
            (Some(Stream(outv)), None)
        }
        (false, true) => {
            let inputs: Vec<Label> = segs.iter().map(|(_, a)| a.as_ref().unwrap().label().clone()).collect();
            let outa = dag.fresh_label(true);
            dag.push(Filter {
                inputs,
                outputs: vec![outa.clone()],
                name: "concat".to_string(),
                params: vec![
                    ("n".to_string(), n.to_string()),
                    ("v".to_string(), "0".to_string()),
                    ("a".to_string(), "1".to_string()),
                ],
            });
            (None, Some(Stream(outa)))
        }
        (false, false) => (None, None),
    }
}

fn compile_sequence(
    dag: &mut StreamDag,
    project: &Project,
    output: &Output,
    seq: &Sequence,
    resolved: &HashMap<String, FragmentResolved>,
    index_map: &HashMap<InputKey, usize>,
) -> Result<(Option<Stream>, Option<Stream>)> {
    let mut base = Vec::new();
    let mut overlays = Vec::new();
    for frag in &seq.fragments {
        if !frag.enabled {
            continue;
        }
        let r = resolved[&frag.id];
        if frag.z_index > 0 {
            overlays.push((frag, r));
        } else {
            base.push((frag, r));
        }
    }
    overlays.sort_by_key(|(frag, _)| frag.z_index);

    // Fragments joined by a plain concat (overlap_left_ms >= 0) accumulate here
    // until a shape change or a crossfade forces a flush, so a whole run of N
    // consecutive same-shape fragments becomes one concat=n=N filter rather
    // than N-1 chained two-way concats.
    let mut pending: Vec<(Option<Stream>, Option<Stream>)> = Vec::new();

    for (i, (frag, r)) in base.iter().enumerate() {
        let v = build_video_stream(dag, project, output, frag, r, index_map)?;
        let a = build_audio_stream(dag, project, frag, r, index_map)?;

        if i == 0 {
            pending.push((v, a));
            continue;
        }

        if frag.overlap_left_ms < 0 {
            let (cv, ca) = push_concat_run(dag, std::mem::take(&mut pending));

            // The dissolve always spans the scheduled overlap window, independent
            // of any -transition-start duration; transition_in only names the effect.
            let duration_ms = frag.overlap_left_ms.abs();
            let transition_name = frag
                .transition_in
                .as_ref()
                .map(|t| t.name.clone())
                .unwrap_or_else(|| "fade".to_string());
            let offset_ms = r.start_ms;

            let nv = match (cv, v) {
                (Some(cv), Some(nv)) => Some(dag::make_xfade(dag, &cv, &nv, duration_ms, offset_ms, &transition_name)?),
                (cv, nv) => nv.or(cv),
            };
            let na = match (ca, a) {
                (Some(ca), Some(na)) => Some(dag::make_acrossfade(dag, &ca, &na, duration_ms)?),
                (ca, na) => na.or(ca),
            };
            pending.push((nv, na));
        } else {
            if let Some(last) = pending.last() {
                if (last.0.is_some(), last.1.is_some()) != (v.is_some(), a.is_some()) {
                    let flushed = push_concat_run(dag, std::mem::take(&mut pending));
                    pending.push(flushed);
                }
            }
            pending.push((v, a));
        }
    }

    let (cur_video, cur_audio) = push_concat_run(dag, pending);
    let mut cur_video = cur_video;
    let mut cur_audio = cur_audio;

    for (frag, r) in &overlays {
        let v = build_video_stream(dag, project, output, frag, r, index_map)?;
        cur_video = match (cur_video.take(), v) {
            (Some(base_v), Some(ov)) => {
                let enable = format!("between(t,{:.3},{:.3})", r.start_ms as f64 / 1000.0, r.end_ms as f64 / 1000.0);
                Some(base_v.overlay(dag, &ov, "0", "0", Some(&enable)))
            }
            (base_v, ov) => ov.or(base_v),
        };
    }

    Ok((cur_video, cur_audio))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn asset(name: &str, duration_ms: i64, w: u32, h: u32, has_video: bool, has_audio: bool) -> Asset {
        Asset {
            name: name.to_string(),
            path: PathBuf::from(format!("input/{name}.mp4")),
            kind: AssetKind::Video,
            duration_ms: TimeMs(duration_ms),
            width: w,
            height: h,
            rotation: 0,
            has_video,
            has_audio,
        }
    }

    fn fragment(id: &str, target: FragmentTarget, duration: DurationSpec, start: StartSpec, overlap_left_ms: i64) -> FragmentSpec {
        FragmentSpec {
            id: id.to_string(),
            target,
            enabled: true,
            trim_start_ms: 0,
            duration,
            object_fit: ObjectFit::Cover,
            start,
            overlap_left_ms,
            transition_in: None,
            transition_out: None,
            z_index: 0,
            end_z_index: None,
            chromakey: None,
            blur_sigma: None,
        }
    }

    fn output(fps: u32, w: u32, h: u32) -> Output {
        Output {
            name: "main".to_string(),
            path: PathBuf::from("output/out.mp4"),
            fps,
            width: w,
            height: h,
            ffmpeg_preset: None,
        }
    }

    #[test]
    fn s1_single_clip_full_duration_matches_dag_fixture() {
        let mut project = Project::new();
        project.assets.insert("clip".to_string(), asset("clip", 5000, 1920, 1080, true, true));
        project.sequences.push(Sequence {
            id: None,
            fragments: vec![fragment(
                "f0",
                FragmentTarget::Asset("clip".to_string()),
                DurationSpec::Literal(5000),
                StartSpec::Auto,
                0,
            )],
        });
        let out = output(30, 1920, 1080);

        let plan = compile(&project, &out).unwrap();
        assert_eq!(
            plan.filter_graph,
            "[0:v]fps=30[L0];[L0]scale=1920:1080:force_original_aspect_ratio=increase,crop=1920:1080[L1];[L1]null[outv];[0:a]anull[outa]"
        );
        assert_eq!(plan.inputs, vec![InputSlotKind::Direct { path: PathBuf::from("input/clip.mp4") }]);
    }

    #[test]
    fn s2_two_clips_concat() {
        let mut project = Project::new();
        project.assets.insert("a".to_string(), asset("a", 3000, 1280, 720, true, true));
        project.assets.insert("b".to_string(), asset("b", 4000, 1280, 720, true, true));
        project.sequences.push(Sequence {
            id: None,
            fragments: vec![
                fragment("f0", FragmentTarget::Asset("a".to_string()), DurationSpec::Literal(3000), StartSpec::Auto, 0),
                fragment("f1", FragmentTarget::Asset("b".to_string()), DurationSpec::Literal(4000), StartSpec::Auto, 0),
            ],
        });
        let out = output(30, 1280, 720);

        let plan = compile(&project, &out).unwrap();
        assert!(plan.filter_graph.contains("concat=n=2:v=1:a=1"));
        assert!(plan.filter_graph.contains("[outv]"));
        assert!(plan.filter_graph.contains("[outa]"));
    }

    #[test]
    fn s2b_run_of_three_zero_overlap_clips_batches_into_one_concat() {
        let mut project = Project::new();
        project.assets.insert("a".to_string(), asset("a", 1000, 1280, 720, true, true));
        project.assets.insert("b".to_string(), asset("b", 1000, 1280, 720, true, true));
        project.assets.insert("c".to_string(), asset("c", 1000, 1280, 720, true, true));
        project.sequences.push(Sequence {
            id: None,
            fragments: vec![
                fragment("f0", FragmentTarget::Asset("a".to_string()), DurationSpec::Literal(1000), StartSpec::Auto, 0),
                fragment("f1", FragmentTarget::Asset("b".to_string()), DurationSpec::Literal(1000), StartSpec::Auto, 0),
                fragment("f2", FragmentTarget::Asset("c".to_string()), DurationSpec::Literal(1000), StartSpec::Auto, 0),
            ],
        });
        let out = output(30, 1280, 720);

        let plan = compile(&project, &out).unwrap();
        assert!(plan.filter_graph.contains("concat=n=3:v=1:a=1"));
        assert!(!plan.filter_graph.contains("concat=n=2"));
    }

    #[test]
    fn s3_crossfade_duration_and_offset() {
        let mut project = Project::new();
        project.assets.insert("a".to_string(), asset("a", 3000, 1920, 1080, true, true));
        project.assets.insert("b".to_string(), asset("b", 3000, 1920, 1080, true, true));
        let mut b = fragment(
            "f1",
            FragmentTarget::Asset("b".to_string()),
            DurationSpec::Literal(3000),
            StartSpec::Auto,
            -1000,
        );
        b.transition_in = Some(Transition { name: "fade".to_string(), duration_ms: 1000 });
        project.sequences.push(Sequence {
            id: None,
            fragments: vec![
                fragment("f0", FragmentTarget::Asset("a".to_string()), DurationSpec::Literal(3000), StartSpec::Auto, 0),
                b,
            ],
        });
        let out = output(30, 1920, 1080);

        let plan = compile(&project, &out).unwrap();
        assert!(plan.filter_graph.contains("xfade=duration=1:offset=2:transition=fade"));
        assert!(plan.filter_graph.contains("acrossfade=d=1"));
    }

    #[test]
    fn s3b_crossfade_duration_follows_overlap_not_transition_duration() {
        // transition_in names a 2s fade but the scheduled overlap is only 500ms;
        // the xfade/acrossfade duration must follow the overlap, not the transition.
        let mut project = Project::new();
        project.assets.insert("a".to_string(), asset("a", 3000, 1920, 1080, true, true));
        project.assets.insert("b".to_string(), asset("b", 3000, 1920, 1080, true, true));
        let mut b = fragment(
            "f1",
            FragmentTarget::Asset("b".to_string()),
            DurationSpec::Literal(3000),
            StartSpec::Auto,
            -500,
        );
        b.transition_in = Some(Transition { name: "wipeleft".to_string(), duration_ms: 2000 });
        project.sequences.push(Sequence {
            id: None,
            fragments: vec![
                fragment("f0", FragmentTarget::Asset("a".to_string()), DurationSpec::Literal(3000), StartSpec::Auto, 0),
                b,
            ],
        });
        let out = output(30, 1920, 1080);

        let plan = compile(&project, &out).unwrap();
        assert!(plan.filter_graph.contains("xfade=duration=0.5:offset=2.5:transition=wipeleft"));
        assert!(plan.filter_graph.contains("acrossfade=d=0.5"));
        assert!(!plan.filter_graph.contains("duration=2"));
    }

    #[test]
    fn s4_expression_forward_reference_resolves_in_pass_two() {
        let mut project = Project::new();
        project.assets.insert("intro_asset".to_string(), asset("intro_asset", 20_000, 1920, 1080, true, false));
        project.assets.insert("ending_asset".to_string(), asset("ending_asset", 20_000, 1920, 1080, true, false));

        let intro_duration = expr::parse("calc(url(#ending.time.start))").unwrap();
        let intro = fragment(
            "intro",
            FragmentTarget::Asset("intro_asset".to_string()),
            DurationSpec::Expr(intro_duration),
            StartSpec::Auto,
            0,
        );
        let ending = fragment(
            "ending",
            FragmentTarget::Asset("ending_asset".to_string()),
            DurationSpec::Literal(2000),
            StartSpec::Literal(8000),
            0,
        );
        project.sequences.push(Sequence {
            id: None,
            fragments: vec![intro, ending],
        });

        let (resolved, _ctx) = resolve_timings(&project).unwrap();
        assert_eq!(resolved["intro"].duration_ms, 8000);
        assert_eq!(resolved["ending"].start_ms, 8000);
    }

    #[test]
    fn unresolvable_expression_lists_remaining_fragments() {
        let mut project = Project::new();
        project.assets.insert("a".to_string(), asset("a", 5000, 1920, 1080, true, false));
        let self_referencing = expr::parse("calc(url(#f0.time.start))").unwrap();
        let frag = fragment(
            "f0",
            FragmentTarget::Asset("a".to_string()),
            DurationSpec::Literal(1000),
            StartSpec::Expr(self_referencing),
            0,
        );
        project.sequences.push(Sequence { id: None, fragments: vec![frag] });

        let err = resolve_timings(&project).unwrap_err();
        assert!(matches!(err, CompileError::UnresolvableExpression(ids) if ids == vec!["f0".to_string()]));
    }

    #[test]
    fn unknown_fragment_reference_in_expression_errors_immediately() {
        let mut project = Project::new();
        project.assets.insert("a".to_string(), asset("a", 5000, 1920, 1080, true, false));
        let dangling = expr::parse("calc(url(#missing.time.start))").unwrap();
        let frag = fragment(
            "f0",
            FragmentTarget::Asset("a".to_string()),
            DurationSpec::Expr(dangling),
            StartSpec::Auto,
            0,
        );
        project.sequences.push(Sequence { id: None, fragments: vec![frag] });

        let err = resolve_timings(&project).unwrap_err();
        assert!(matches!(err, CompileError::Core(CoreError::UnknownReference { .. })));
    }

    #[test]
    fn input_indices_are_dense_and_reused_for_repeated_assets() {
        let mut project = Project::new();
        project.assets.insert("a".to_string(), asset("a", 1000, 100, 100, true, false));
        project.assets.insert("b".to_string(), asset("b", 1000, 100, 100, true, false));
        project.assets.insert("c".to_string(), asset("c", 1000, 100, 100, true, false));
        project.sequences.push(Sequence {
            id: None,
            fragments: vec![
                fragment("f0", FragmentTarget::Asset("a".to_string()), DurationSpec::Literal(1000), StartSpec::Auto, 0),
                fragment("f1", FragmentTarget::Asset("b".to_string()), DurationSpec::Literal(1000), StartSpec::Auto, 0),
                fragment("f2", FragmentTarget::Asset("a".to_string()), DurationSpec::Literal(1000), StartSpec::Auto, 0),
                fragment("f3", FragmentTarget::Asset("c".to_string()), DurationSpec::Literal(1000), StartSpec::Auto, 0),
            ],
        });

        let order = assign_input_indices(&project);
        let index_map: Map<InputKey, usize> = order.iter().cloned().enumerate().map(|(i, k)| (k, i)).collect();
        assert_eq!(index_map[&InputKey::Asset("a".to_string())], 0);
        assert_eq!(index_map[&InputKey::Asset("b".to_string())], 1);
        assert_eq!(index_map[&InputKey::Asset("c".to_string())], 2);
    }

    #[test]
    fn duration_exceeding_source_is_rejected() {
        let mut project = Project::new();
        project.assets.insert("a".to_string(), asset("a", 1000, 100, 100, true, false));
        project.sequences.push(Sequence {
            id: None,
            fragments: vec![fragment(
                "f0",
                FragmentTarget::Asset("a".to_string()),
                DurationSpec::Literal(5000),
                StartSpec::Auto,
                0,
            )],
        });
        let out = output(30, 100, 100);
        let err = compile(&project, &out).unwrap_err();
        assert!(matches!(err, CompileError::DurationOverflow { .. }));
    }
}
