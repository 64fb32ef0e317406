//! Stream DAG & Filter Library (§4.6). An append-only graph of labeled
//! audio/video streams, primitive filter constructors, and a fluent
//! builder. Generalizes the ad hoc filter-string assembly the teacher's
//! renderer did inline into a typed, reusable library.

use crate::error::{CompileError, Result};
use stsvideo_core::types::ContainMode;

// ---------------------------------------------------------------------------
// Label / Filter / StreamDag
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Label {
    pub tag: String,
    pub is_audio: bool,
}

impl Label {
    pub fn render(&self) -> String {
        format!("[{}]", self.tag)
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub inputs: Vec<Label>,
    pub outputs: Vec<Label>,
    pub name: String,
    /// Rendered `k=v` when the key is non-empty, or bare `v` (positional)
    /// when the key is empty; joined with `:` — ffmpeg filters freely mix
    /// both forms in one invocation (e.g. `scale=1920:1080:force_original_aspect_ratio=increase`).
    pub params: Vec<(String, String)>,
}

impl Filter {
    fn render(&self) -> String {
        let ins: String = self.inputs.iter().map(Label::render).collect();
        let outs: String = self.outputs.iter().map(Label::render).collect();
        if self.params.is_empty() {
            format!("{ins}{}{outs}", self.name)
        } else {
            let kv = self
                .params
                .iter()
                .map(|(k, v)| if k.is_empty() { v.clone() } else { format!("{k}={v}") })
                .collect::<Vec<_>>()
                .join(":");
            format!("{ins}{}={kv}{outs}", self.name)
        }
    }
}

/// Owns the filters of one compile. Append-only; labels are minted from a
/// monotonic counter so they are pairwise distinct across the whole graph.
#[derive(Debug, Default)]
pub struct StreamDag {
    filters: Vec<Filter>,
    counter: u64,
}

impl StreamDag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh_label(&mut self, is_audio: bool) -> Label {
        let tag = format!("L{}", self.counter);
        self.counter += 1;
        Label { tag, is_audio }
    }

    pub fn push(&mut self, filter: Filter) {
        self.filters.push(filter);
    }

    pub fn input_label(index: usize, is_audio: bool) -> Label {
        Label {
            tag: format!("{index}:{}", if is_audio { "a" } else { "v" }),
            is_audio,
        }
    }

    pub fn render(&self) -> String {
        self.filters.iter().map(Filter::render).collect::<Vec<_>>().join(";")
    }

    pub fn filter_count(&self) -> usize {
        self.filters.len()
    }
}

// ---------------------------------------------------------------------------
// Stream — fluent handle on "the current loose end"
// ---------------------------------------------------------------------------

pub enum FadeDirection {
    In,
    Out,
}

#[derive(Debug, Clone)]
pub struct Stream(pub Label);

impl Stream {
    pub fn from_input(index: usize, is_audio: bool) -> Self {
        Stream(StreamDag::input_label(index, is_audio))
    }

    pub fn label(&self) -> &Label {
        &self.0
    }

    fn push1(&self, dag: &mut StreamDag, name: &str, params: Vec<(String, String)>) -> Stream {
        let out = dag.fresh_label(self.0.is_audio);
        dag.push(Filter {
            inputs: vec![self.0.clone()],
            outputs: vec![out.clone()],
            name: name.to_string(),
            params,
        });
        Stream(out)
    }

    fn positional<I: IntoIterator<Item = String>>(vals: I) -> Vec<(String, String)> {
        vals.into_iter().map(|v| (String::new(), v)).collect()
    }

    pub fn scale(&self, dag: &mut StreamDag, w: u32, h: u32) -> Stream {
        self.push1(dag, "scale", Self::positional([w.to_string(), h.to_string()]))
    }

    pub fn fps(&self, dag: &mut StreamDag, n: u32) -> Stream {
        self.push1(dag, "fps", Self::positional([n.to_string()]))
    }

    /// Upright-orients video per the asset's probed rotation. A no-op for
    /// 0 degrees — no filter node is emitted, matching unrotated footage
    /// passing straight through to the next stage.
    pub fn transpose(&self, dag: &mut StreamDag, rotation_degrees: u16) -> Stream {
        match rotation_degrees % 360 {
            0 => self.clone(),
            90 => self.push1(dag, "transpose", Self::positional(["1".to_string()])),
            180 => self
                .push1(dag, "transpose", Self::positional(["1".to_string()]))
                .push1(dag, "transpose", Self::positional(["1".to_string()])),
            270 => self.push1(dag, "transpose", Self::positional(["2".to_string()])),
            _ => self.clone(),
        }
    }

    /// Emits `trim`/`setpts` (video) or `atrim`/`asetpts` (audio) reset to
    /// zero, as one chained filter expression.
    pub fn trim(&self, dag: &mut StreamDag, start_ms: i64, duration_ms: i64) -> Stream {
        let start_s = start_ms as f64 / 1000.0;
        let end_s = (start_ms + duration_ms) as f64 / 1000.0;
        let name = if self.0.is_audio {
            format!("atrim=start={start_s:.3}:end={end_s:.3},asetpts=PTS-STARTPTS")
        } else {
            format!("trim=start={start_s:.3}:end={end_s:.3},setpts=PTS-STARTPTS")
        };
        self.push1(dag, &name, vec![])
    }

    pub fn fit_cover(&self, dag: &mut StreamDag, w: u32, h: u32) -> Stream {
        let name = format!("scale={w}:{h}:force_original_aspect_ratio=increase,crop={w}:{h}");
        self.push1(dag, &name, vec![])
    }

    pub fn fit_contain(&self, dag: &mut StreamDag, w: u32, h: u32, mode: &ContainMode) -> Stream {
        match mode {
            ContainMode::Letterbox => self.pad_to_contain(dag, w, h, "black"),
            ContainMode::Pillarbox { color } => self.pad_to_contain(dag, w, h, color),
            ContainMode::Ambient {
                blur,
                brightness,
                saturation,
            } => self.ambient_contain(dag, w, h, *blur, *brightness, *saturation),
        }
    }

    fn pad_to_contain(&self, dag: &mut StreamDag, w: u32, h: u32, color: &str) -> Stream {
        let name = format!(
            "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2:color={color}"
        );
        self.push1(dag, &name, vec![])
    }

    /// Splits the source into a blurred, fill-scaled background and a
    /// fit-scaled foreground, then composites the foreground centered.
    fn ambient_contain(
        &self,
        dag: &mut StreamDag,
        w: u32,
        h: u32,
        blur: f64,
        brightness: f64,
        saturation: f64,
    ) -> Stream {
        let branches = self.split(dag, 2);
        let background = branches[0]
            .fit_cover(dag, w, h)
            .gblur(dag, blur)
            .push1(
                dag,
                "eq",
                vec![
                    ("brightness".to_string(), brightness.to_string()),
                    ("saturation".to_string(), saturation.to_string()),
                ],
            );
        let foreground = branches[1].push1(
            dag,
            "scale",
            vec![
                (String::new(), format!("{w}:{h}")),
                ("force_original_aspect_ratio".to_string(), "decrease".to_string()),
            ],
        );
        background.overlay(dag, &foreground, "(W-w)/2", "(H-h)/2", None)
    }

    pub fn gblur(&self, dag: &mut StreamDag, sigma: f64) -> Stream {
        self.push1(dag, "gblur", vec![("sigma".to_string(), sigma.to_string())])
    }

    pub fn eq(&self, dag: &mut StreamDag, contrast: f64, brightness: f64) -> Stream {
        self.push1(
            dag,
            "eq",
            vec![
                ("contrast".to_string(), contrast.to_string()),
                ("brightness".to_string(), brightness.to_string()),
            ],
        )
    }

    pub fn crop(&self, dag: &mut StreamDag, w: u32, h: u32) -> Stream {
        self.push1(dag, "crop", Self::positional([w.to_string(), h.to_string()]))
    }

    pub fn format(&self, dag: &mut StreamDag, pixfmt: &str) -> Stream {
        self.push1(dag, "format", Self::positional([pixfmt.to_string()]))
    }

    pub fn fade(&self, dag: &mut StreamDag, direction: FadeDirection, start_ms: i64, duration_ms: i64) -> Stream {
        let t = match direction {
            FadeDirection::In => "in",
            FadeDirection::Out => "out",
        };
        let name = if self.0.is_audio { "afade" } else { "fade" };
        self.push1(
            dag,
            name,
            vec![
                ("t".to_string(), t.to_string()),
                ("st".to_string(), (start_ms as f64 / 1000.0).to_string()),
                ("d".to_string(), (duration_ms as f64 / 1000.0).to_string()),
            ],
        )
    }

    pub fn colorkey(&self, dag: &mut StreamDag, color: &str, similarity: f64, blend: f64) -> Stream {
        self.push1(
            dag,
            "colorkey",
            Self::positional([color.to_string(), similarity.to_string(), blend.to_string()]),
        )
    }

    pub fn setpts(&self, dag: &mut StreamDag, expr: &str) -> Stream {
        let name = if self.0.is_audio { "asetpts" } else { "setpts" };
        self.push1(dag, name, Self::positional([expr.to_string()]))
    }

    pub fn drawtext(&self, dag: &mut StreamDag, text: &str, x: &str, y: &str, extra: &[(String, String)]) -> Stream {
        let mut params = vec![
            ("text".to_string(), format!("'{text}'")),
            ("x".to_string(), x.to_string()),
            ("y".to_string(), y.to_string()),
        ];
        params.extend(extra.iter().cloned());
        self.push1(dag, "drawtext", params)
    }

    pub fn split(&self, dag: &mut StreamDag, n: usize) -> Vec<Stream> {
        let outs: Vec<Label> = (0..n).map(|_| dag.fresh_label(self.0.is_audio)).collect();
        let name = if self.0.is_audio { "asplit" } else { "split" };
        let params = if n == 2 {
            vec![]
        } else {
            vec![(String::new(), n.to_string())]
        };
        dag.push(Filter {
            inputs: vec![self.0.clone()],
            outputs: outs.clone(),
            name: name.to_string(),
            params,
        });
        outs.into_iter().map(Stream).collect()
    }

    pub fn overlay(&self, dag: &mut StreamDag, other: &Stream, x: &str, y: &str, enable: Option<&str>) -> Stream {
        let mut params = vec![
            ("x".to_string(), x.to_string()),
            ("y".to_string(), y.to_string()),
        ];
        if let Some(expr) = enable {
            params.push(("enable".to_string(), format!("'{expr}'")));
        }
        let out = dag.fresh_label(false);
        dag.push(Filter {
            inputs: vec![self.0.clone(), other.0.clone()],
            outputs: vec![out.clone()],
            name: "overlay".to_string(),
            params,
        });
        Stream(out)
    }

    /// Terminates the graph at a fixed output label (`outv`/`outa`).
    pub fn end_to(&self, dag: &mut StreamDag, explicit_tag: &str) {
        let out = Label {
            tag: explicit_tag.to_string(),
            is_audio: self.0.is_audio,
        };
        let name = if self.0.is_audio { "anull" } else { "null" };
        dag.push(Filter {
            inputs: vec![self.0.clone()],
            outputs: vec![out],
            name: name.to_string(),
            params: vec![],
        });
    }
}

// ---------------------------------------------------------------------------
// Concat / XFade / AMix — free functions operating across streams
// ---------------------------------------------------------------------------

/// Chooses the factorization `(n, v, a)` maximizing segment count `n` for a
/// flat, isAudio-interleaved label list, then emits one `concat` filter.
pub fn make_concat(dag: &mut StreamDag, labels: &[Label]) -> Result<(Vec<Label>, Vec<Label>)> {
    if labels.is_empty() {
        return Err(CompileError::InvalidFilterInputs {
            filter_name: "concat".to_string(),
            details: "no input labels".to_string(),
        });
    }

    let v = labels.iter().take_while(|l| !l.is_audio).count();
    if v == 0 {
        return Err(CompileError::InvalidFilterInputs {
            filter_name: "concat".to_string(),
            details: "first segment has no video labels".to_string(),
        });
    }
    let a = labels[v..].iter().take_while(|l| l.is_audio).count();
    let block = v + a;
    if labels.len() % block != 0 {
        return Err(CompileError::InvalidFilterInputs {
            filter_name: "concat".to_string(),
            details: format!("{} labels do not partition evenly into segments of {block}", labels.len()),
        });
    }
    let n = labels.len() / block;

    for (seg_idx, chunk) in labels.chunks(block).enumerate() {
        for (i, label) in chunk.iter().enumerate() {
            let expected_audio = i >= v;
            if label.is_audio != expected_audio {
                return Err(CompileError::InvalidFilterInputs {
                    filter_name: "concat".to_string(),
                    details: format!("segment {seg_idx} does not match the v={v}/a={a} interleaving"),
                });
            }
        }
    }

    let video_outs: Vec<Label> = (0..v).map(|_| dag.fresh_label(false)).collect();
    let audio_outs: Vec<Label> = (0..a).map(|_| dag.fresh_label(true)).collect();
    let mut outputs = video_outs.clone();
    outputs.extend(audio_outs.clone());

    dag.push(Filter {
        inputs: labels.to_vec(),
        outputs,
        name: "concat".to_string(),
        params: vec![
            ("n".to_string(), n.to_string()),
            ("v".to_string(), v.to_string()),
            ("a".to_string(), a.to_string()),
        ],
    });

    Ok((video_outs, audio_outs))
}

pub fn make_xfade(
    dag: &mut StreamDag,
    a: &Stream,
    b: &Stream,
    duration_ms: i64,
    offset_ms: i64,
    transition: &str,
) -> Result<Stream> {
    for s in [a, b] {
        if s.0.is_audio {
            return Err(CompileError::InvalidFilterInputs {
                filter_name: "xfade".to_string(),
                details: format!("xfade requires video inputs, got audio label {:?}", s.0.tag),
            });
        }
    }
    let out = dag.fresh_label(false);
    dag.push(Filter {
        inputs: vec![a.0.clone(), b.0.clone()],
        outputs: vec![out.clone()],
        name: "xfade".to_string(),
        params: vec![
            ("duration".to_string(), (duration_ms as f64 / 1000.0).to_string()),
            ("offset".to_string(), (offset_ms as f64 / 1000.0).to_string()),
            ("transition".to_string(), transition.to_string()),
        ],
    });
    Ok(Stream(out))
}

pub fn make_acrossfade(dag: &mut StreamDag, a: &Stream, b: &Stream, duration_ms: i64) -> Result<Stream> {
    for s in [a, b] {
        if !s.0.is_audio {
            return Err(CompileError::InvalidFilterInputs {
                filter_name: "acrossfade".to_string(),
                details: format!("acrossfade requires audio inputs, got video label {:?}", s.0.tag),
            });
        }
    }
    let out = dag.fresh_label(true);
    dag.push(Filter {
        inputs: vec![a.0.clone(), b.0.clone()],
        outputs: vec![out.clone()],
        name: "acrossfade".to_string(),
        params: vec![("d".to_string(), (duration_ms as f64 / 1000.0).to_string())],
    });
    Ok(Stream(out))
}

pub fn make_amix(dag: &mut StreamDag, streams: &[Stream]) -> Result<Stream> {
    if streams.is_empty() {
        return Err(CompileError::InvalidFilterInputs {
            filter_name: "amix".to_string(),
            details: "no audio streams to mix".to_string(),
        });
    }
    if let Some(offender) = streams.iter().find(|s| !s.0.is_audio) {
        return Err(CompileError::InvalidFilterInputs {
            filter_name: "amix".to_string(),
            details: format!("amix requires audio inputs, got video label {:?}", offender.0.tag),
        });
    }
    let out = dag.fresh_label(true);
    dag.push(Filter {
        inputs: streams.iter().map(|s| s.0.clone()).collect(),
        outputs: vec![out.clone()],
        name: "amix".to_string(),
        params: vec![("inputs".to_string(), streams.len().to_string())],
    });
    Ok(Stream(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_single_clip_full_duration() {
        let mut dag = StreamDag::new();
        let video = Stream::from_input(0, false).fps(&mut dag, 30).fit_cover(&mut dag, 1920, 1080);
        video.end_to(&mut dag, "outv");
        Stream::from_input(0, true).end_to(&mut dag, "outa");

        let graph = dag.render();
        assert_eq!(
            graph,
            "[0:v]fps=30[L0];[L0]scale=1920:1080:force_original_aspect_ratio=increase,crop=1920:1080[L1];[L1]null[outv];[0:a]anull[outa]"
        );
    }

    #[test]
    fn labels_are_pairwise_distinct_and_avoid_reserved_terminals() {
        let mut dag = StreamDag::new();
        let mut seen = std::collections::HashSet::new();
        let mut s = Stream::from_input(0, false);
        for _ in 0..5 {
            s = s.fps(&mut dag, 30);
            assert!(seen.insert(s.0.tag.clone()));
            assert_ne!(s.0.tag, "outv");
            assert_ne!(s.0.tag, "outa");
        }
    }

    #[test]
    fn input_index_stability_for_repeated_assets() {
        let indices = [0usize, 1, 0, 2];
        let labels: Vec<Label> = indices.iter().map(|&i| StreamDag::input_label(i, false)).collect();
        let tags: Vec<&str> = labels.iter().map(|l| l.tag.as_str()).collect();
        assert_eq!(tags, vec!["0:v", "1:v", "0:v", "2:v"]);
    }

    #[test]
    fn concat_factorization_selects_maximal_segment_count() {
        let mut dag = StreamDag::new();
        let labels = vec![
            Label { tag: "a0".into(), is_audio: false },
            Label { tag: "a1".into(), is_audio: true },
            Label { tag: "b0".into(), is_audio: false },
            Label { tag: "b1".into(), is_audio: true },
            Label { tag: "c0".into(), is_audio: false },
            Label { tag: "c1".into(), is_audio: true },
        ];
        let (v, a) = make_concat(&mut dag, &labels).unwrap();
        assert_eq!(v.len(), 1);
        assert_eq!(a.len(), 1);
        assert!(dag.render().contains("concat=n=3:v=1:a=1"));
    }

    #[test]
    fn concat_rejects_empty_input() {
        let mut dag = StreamDag::new();
        let err = make_concat(&mut dag, &[]).unwrap_err();
        assert!(matches!(err, CompileError::InvalidFilterInputs { .. }));
    }

    #[test]
    fn xfade_rejects_audio_label() {
        let mut dag = StreamDag::new();
        let video = Stream::from_input(0, false);
        let audio = Stream::from_input(1, true);
        let err = make_xfade(&mut dag, &video, &audio, 1000, 2000, "fade").unwrap_err();
        assert!(matches!(err, CompileError::InvalidFilterInputs { .. }));
    }

    #[test]
    fn xfade_renders_expected_params() {
        let mut dag = StreamDag::new();
        let a = Stream::from_input(0, false);
        let b = Stream::from_input(1, false);
        let fused = make_xfade(&mut dag, &a, &b, 1000, 2000, "fade").unwrap();
        fused.end_to(&mut dag, "outv");
        assert!(dag.render().contains("xfade=duration=1:offset=2:transition=fade"));
    }

    #[test]
    fn acrossfade_rejects_video_label() {
        let mut dag = StreamDag::new();
        let video = Stream::from_input(0, false);
        let audio = Stream::from_input(1, true);
        let err = make_acrossfade(&mut dag, &video, &audio, 1000).unwrap_err();
        assert!(matches!(err, CompileError::InvalidFilterInputs { .. }));
    }

    #[test]
    fn transpose_zero_degrees_is_a_no_op() {
        let mut dag = StreamDag::new();
        let before = Stream::from_input(0, false);
        let after = before.transpose(&mut dag, 0);
        assert_eq!(before.0.tag, after.0.tag);
        assert_eq!(dag.filter_count(), 0);
    }

    #[test]
    fn transpose_180_chains_two_filters() {
        let mut dag = StreamDag::new();
        Stream::from_input(0, false).transpose(&mut dag, 180);
        assert_eq!(dag.filter_count(), 2);
    }
}
