//! Project Model Builder (§4.4). Walks the C1 markup tree and style cascade,
//! consults the C3 probe for each referenced asset, and assembles the typed
//! `Project` of §3. Each render re-runs this from scratch (§5) — the
//! builder carries no state across outputs.

use crate::error::{CompileError, Result};
use crate::probe::{self, ProbeData};
use std::path::{Path, PathBuf};
use stsvideo_core::attrs;
use stsvideo_core::markup::{self, Node};
use stsvideo_core::style::{self, Stylesheet};
use stsvideo_core::types::*;

/// Reads `<project_dir>/project.html` (§6) and builds the typed Project.
pub fn build_project(project_dir: &Path) -> Result<Project> {
    let doc_path = project_dir.join("project.html");
    let source = std::fs::read_to_string(&doc_path)?;
    build_project_from_source(&source, project_dir)
}

pub fn build_project_from_source(source: &str, project_dir: &Path) -> Result<Project> {
    let root = markup::parse(source)?;

    let css_text = root
        .children_of("style")
        .next()
        .map(|n| n.raw_text())
        .unwrap_or_default();
    let sheet = style::parse_stylesheet(&css_text)?;

    let mut project = Project::new();
    project.css_text = css_text;

    build_assets(&root, project_dir, &mut project)?;
    build_outputs(&root, &mut project)?;
    build_ffmpeg_presets(&root, &mut project);
    build_upload_configs(&root, &mut project);
    build_containers_and_apps(&root, project_dir, &sheet, &mut project)?;
    build_sequences(&root, &sheet, &mut project)?;

    validate(&project)?;

    Ok(project)
}

fn build_assets(root: &Node, project_dir: &Path, project: &mut Project) -> Result<()> {
    let Some(assets_node) = root.children_of("assets").next() else {
        return Ok(());
    };
    for node in assets_node.children_of("asset") {
        let name = node
            .attr("data-name")
            .ok_or_else(|| CompileError::InvalidOutput {
                name: "<asset>".to_string(),
                detail: "missing data-name".to_string(),
            })?
            .to_string();
        let rel_path = node
            .attr("data-path")
            .ok_or_else(|| CompileError::InvalidOutput {
                name: name.clone(),
                detail: "missing data-path".to_string(),
            })?;
        let path = resolve_path(project_dir, rel_path);

        let kind = node
            .attr("data-type")
            .and_then(parse_kind)
            .or_else(|| probe::detect_kind_from_extension(&path))
            .unwrap_or(AssetKind::Video);

        let ProbeData {
            duration_ms,
            width,
            height,
            rotation,
            has_video,
            has_audio,
        } = probe::probe_asset(&path)?;

        project.assets.insert(
            name.clone(),
            Asset {
                name,
                path,
                kind,
                duration_ms: TimeMs(duration_ms),
                width,
                height,
                rotation,
                has_video,
                has_audio,
            },
        );
    }
    Ok(())
}

fn parse_kind(value: &str) -> Option<AssetKind> {
    match value {
        "video" => Some(AssetKind::Video),
        "image" => Some(AssetKind::Image),
        "audio" => Some(AssetKind::Audio),
        _ => None,
    }
}

fn build_outputs(root: &Node, project: &mut Project) -> Result<()> {
    let Some(outputs_node) = root.children_of("outputs").next() else {
        return Ok(());
    };
    for node in outputs_node.children_of("output") {
        let name = node
            .attr("data-name")
            .ok_or_else(|| CompileError::InvalidOutput {
                name: "<output>".to_string(),
                detail: "missing data-name".to_string(),
            })?
            .to_string();
        let path = PathBuf::from(node.attr("data-path").unwrap_or("output/out.mp4"));
        let fps: u32 = node
            .attr("data-fps")
            .unwrap_or("30")
            .parse()
            .map_err(|_| CompileError::InvalidOutput {
                name: name.clone(),
                detail: "data-fps is not an integer".to_string(),
            })?;
        let (width, height) = parse_resolution(node.attr("data-resolution").unwrap_or(""))
            .ok_or_else(|| CompileError::InvalidOutput {
                name: name.clone(),
                detail: "data-resolution must be WxH".to_string(),
            })?;
        if fps == 0 || width == 0 || height == 0 {
            return Err(CompileError::InvalidOutput {
                name,
                detail: "fps and resolution must be non-zero".to_string(),
            });
        }
        project.outputs.insert(
            name.clone(),
            Output {
                name,
                path,
                fps,
                width,
                height,
                ffmpeg_preset: node.attr("data-ffmpeg").map(str::to_string),
            },
        );
    }
    Ok(())
}

fn parse_resolution(value: &str) -> Option<(u32, u32)> {
    let (w, h) = value.split_once('x').or_else(|| value.split_once('X'))?;
    Some((w.trim().parse().ok()?, h.trim().parse().ok()?))
}

fn build_ffmpeg_presets(root: &Node, project: &mut Project) {
    let Some(ffmpeg_node) = root.children_of("ffmpeg").next() else {
        return;
    };
    for node in ffmpeg_node.children_of("preset") {
        if let Some(name) = node.attr("data-name") {
            let args = node.attr("data-args").unwrap_or("").to_string();
            project.ffmpeg_presets.insert(name.to_string(), args);
        }
    }
}

fn build_upload_configs(root: &Node, project: &mut Project) {
    let Some(upload_node) = root.children_of("upload").next() else {
        return;
    };
    for node in upload_node.children.iter() {
        if let markup::Child::Element(n) = node {
            let obj: serde_json::Map<String, serde_json::Value> = n
                .attrs
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect();
            project
                .upload_configs
                .insert(n.tag.clone(), serde_json::Value::Object(obj));
        }
    }
}

fn build_containers_and_apps(
    root: &Node,
    project_dir: &Path,
    _sheet: &Stylesheet,
    project: &mut Project,
) -> Result<()> {
    for node in root.children_of("container") {
        let id = node
            .id()
            .ok_or_else(|| CompileError::InvalidOutput {
                name: "<container>".to_string(),
                detail: "missing id".to_string(),
            })?
            .to_string();
        project.containers.insert(
            id.clone(),
            Container {
                id,
                inner_html: node.raw_text(),
                css_text: project.css_text.clone(),
                png_path: None,
            },
        );
    }

    for node in root.children_of("app") {
        let id = node
            .id()
            .ok_or_else(|| CompileError::InvalidOutput {
                name: "<app>".to_string(),
                detail: "missing id".to_string(),
            })?
            .to_string();
        let dir = resolve_path(project_dir, node.attr("data-dir").unwrap_or(""));
        let params = node
            .attr("data-params")
            .map(serde_json::from_str)
            .transpose()?
            .unwrap_or_default();
        let tags = node
            .attr("data-tags")
            .map(|t| t.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        project.apps.insert(
            id.clone(),
            App {
                id,
                dir,
                params,
                title: node.attr("data-title").map(str::to_string),
                date: node.attr("data-date").map(str::to_string),
                tags,
                png_path: None,
            },
        );
    }
    Ok(())
}

fn build_sequences(root: &Node, sheet: &Stylesheet, project: &mut Project) -> Result<()> {
    for (seq_idx, seq_node) in root.children_of("sequence").enumerate() {
        let mut fragments = Vec::new();
        for (frag_idx, frag_node) in seq_node.children_of("fragment").enumerate() {
            fragments.push(build_fragment(frag_node, sheet, seq_idx, frag_idx)?);
        }
        project.sequences.push(Sequence {
            id: seq_node.id().map(str::to_string),
            fragments,
        });
    }
    Ok(())
}

fn build_fragment(node: &Node, sheet: &Stylesheet, seq_idx: usize, frag_idx: usize) -> Result<FragmentSpec> {
    let id = node
        .attr("data-id")
        .or_else(|| node.id())
        .map(str::to_string)
        .unwrap_or_else(|| format!("f{seq_idx}_{frag_idx}"));

    let target = fragment_target(node, &id)?;

    let style = style::resolve_style(node, sheet);
    let get = |key: &str| style.get(key).map(String::as_str);

    let enabled = node.attr("data-enabled") != Some("false");

    let trim_start_ms = get("-trim-start")
        .map(attrs::parse_ms_literal)
        .transpose()?
        .unwrap_or(0);

    let duration = match (get("-duration"), get("-offset-end")) {
        (Some(d), _) => attrs::parse_duration(d)?,
        (None, Some(end)) => DurationSpec::UntilEnd(attrs::parse_end_bound(end)?),
        (None, None) => match &target {
            FragmentTarget::Asset(_) => DurationSpec::FullSource,
            _ => {
                return Err(CompileError::InvalidFragmentTarget {
                    fragment_id: id,
                    detail: "container/app fragments require an explicit -duration".to_string(),
                })
            }
        },
    };

    let start = get("-offset-start")
        .map(attrs::parse_start)
        .transpose()?
        .unwrap_or(StartSpec::Auto);

    let overlap_left_ms = get("-overlay-left")
        .map(attrs::parse_ms_literal)
        .transpose()?
        .unwrap_or(0);

    let object_fit = get("-object-fit")
        .map(attrs::parse_object_fit)
        .transpose()?
        .unwrap_or(ObjectFit::Cover);

    let transition_in = get("-transition-start").map(attrs::parse_transition).transpose()?;
    let transition_out = get("-transition-end").map(attrs::parse_transition).transpose()?;

    let z_index = get("-overlay-start-z-index")
        .map(|v| v.trim().parse::<i32>())
        .transpose()
        .map_err(|_| CompileError::InvalidFragmentTarget {
            fragment_id: id.clone(),
            detail: "-overlay-start-z-index must be an integer".to_string(),
        })?
        .unwrap_or(0);
    let end_z_index = get("-overlay-end-z-index")
        .map(|v| v.trim().parse::<i32>())
        .transpose()
        .map_err(|_| CompileError::InvalidFragmentTarget {
            fragment_id: id.clone(),
            detail: "-overlay-end-z-index must be an integer".to_string(),
        })?;

    let chromakey = get("-chromakey").map(attrs::parse_chromakey).transpose()?;
    let blur_sigma = get("filter").map(attrs::parse_blur_filter).transpose()?;

    Ok(FragmentSpec {
        id,
        target,
        enabled,
        trim_start_ms,
        duration,
        object_fit,
        start,
        overlap_left_ms,
        transition_in,
        transition_out,
        z_index,
        end_z_index,
        chromakey,
        blur_sigma,
    })
}

fn fragment_target(node: &Node, id: &str) -> Result<FragmentTarget> {
    let candidates = [
        ("data-asset", FragmentTarget::Asset as fn(String) -> FragmentTarget),
        ("data-container", FragmentTarget::Container as fn(String) -> FragmentTarget),
        ("data-app", FragmentTarget::App as fn(String) -> FragmentTarget),
    ];
    let mut found = Vec::new();
    for (attr_name, ctor) in candidates {
        if let Some(value) = node.attr(attr_name) {
            found.push(ctor(value.to_string()));
        }
    }
    match found.len() {
        1 => Ok(found.into_iter().next().unwrap()),
        0 => Err(CompileError::InvalidFragmentTarget {
            fragment_id: id.to_string(),
            detail: "fragment has no data-asset/data-container/data-app".to_string(),
        }),
        _ => Err(CompileError::InvalidFragmentTarget {
            fragment_id: id.to_string(),
            detail: "fragment must reference exactly one of data-asset/data-container/data-app".to_string(),
        }),
    }
}

fn resolve_path(project_dir: &Path, rel: &str) -> PathBuf {
    let candidate = Path::new(rel);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        project_dir.join(candidate)
    }
}

fn validate(project: &Project) -> Result<()> {
    for sequence in &project.sequences {
        for frag in &sequence.fragments {
            match &frag.target {
                FragmentTarget::Asset(name) => {
                    if !project.assets.contains_key(name) {
                        return Err(CompileError::UnknownReference {
                            fragment_id: frag.id.clone(),
                            target_name: name.clone(),
                        });
                    }
                }
                FragmentTarget::Container(name) => {
                    if !project.containers.contains_key(name) {
                        return Err(CompileError::UnknownReference {
                            fragment_id: frag.id.clone(),
                            target_name: name.clone(),
                        });
                    }
                }
                FragmentTarget::App(name) => {
                    if !project.apps.contains_key(name) {
                        return Err(CompileError::UnknownReference {
                            fragment_id: frag.id.clone(),
                            target_name: name.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_png(path: &Path) {
        // Minimal 1x1 transparent PNG so the probe's header reader succeeds.
        let bytes: &[u8] = &[
            0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48,
            0x44, 0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00,
            0x00, 0x1F, 0x15, 0xC4, 0x89,
        ];
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn builds_single_image_fragment_project() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("still.png"));

        let doc = r#"<project>
            <style>.title { -duration: 2000ms; }</style>
            <outputs>
                <output data-name="main" data-path="output/out.mp4" data-fps="30" data-resolution="1920x1080" />
            </outputs>
            <assets>
                <asset data-name="still" data-path="still.png" />
            </assets>
            <sequence>
                <fragment data-asset="still" class="title" />
            </sequence>
        </project>"#;

        let project = build_project_from_source(doc, dir.path()).unwrap();
        assert_eq!(project.assets.len(), 1);
        assert_eq!(project.outputs.len(), 1);
        assert_eq!(project.sequences.len(), 1);
        let frag = &project.sequences[0].fragments[0];
        assert!(matches!(frag.duration, DurationSpec::Literal(2000)));
        assert!(matches!(frag.target, FragmentTarget::Asset(ref n) if n == "still"));
    }

    #[test]
    fn unknown_asset_reference_errors() {
        let dir = tempfile::tempdir().unwrap();
        let doc = r#"<project>
            <outputs><output data-name="main" data-path="o.mp4" data-fps="30" data-resolution="100x100" /></outputs>
            <sequence><fragment data-asset="missing" data-duration="1000ms" /></sequence>
        </project>"#;
        let err = build_project_from_source(doc, dir.path()).unwrap_err();
        assert!(matches!(err, CompileError::UnknownReference { .. }));
    }

    #[test]
    fn container_fragment_without_duration_errors() {
        let dir = tempfile::tempdir().unwrap();
        let doc = r#"<project>
            <container id="title"><h1>hi</h1></container>
            <sequence><fragment data-container="title" /></sequence>
        </project>"#;
        let err = build_project_from_source(doc, dir.path()).unwrap_err();
        assert!(matches!(err, CompileError::InvalidFragmentTarget { .. }));
    }

    #[test]
    fn fragment_with_two_targets_errors() {
        let dir = tempfile::tempdir().unwrap();
        write_png(&dir.path().join("still.png"));
        let doc = r#"<project>
            <container id="title"><h1>hi</h1></container>
            <assets><asset data-name="still" data-path="still.png" /></assets>
            <sequence><fragment data-asset="still" data-container="title" /></sequence>
        </project>"#;
        let err = build_project_from_source(doc, dir.path()).unwrap_err();
        assert!(matches!(err, CompileError::InvalidFragmentTarget { .. }));
    }

    #[test]
    fn resolution_parses_width_and_height() {
        assert_eq!(parse_resolution("1920x1080"), Some((1920, 1080)));
        assert_eq!(parse_resolution("bogus"), None);
    }
}
