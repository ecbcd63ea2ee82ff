use image::{Rgba, RgbaImage};

use paintcore::canvas::{BlendMode, LayerStack};
use paintcore::cli::{self, OutputFormat};
use paintcore::color::Rgb;
use paintcore::io::{StorageProject, load_layer_stack, write_png};
use paintcore::ops::filters::{BrightnessContrastInput, FilterId, FilterInput, builtin};
use paintcore::ops::gradient::GradientParams;
use paintcore::ops::pipeline::{Invocation, PipelineState};
use paintcore::ops::shapes::{ShapeKind, ShapeParams};
use paintcore::session::EditingSession;
use paintcore::settings::EngineSettings;

fn gradient_image(w: u32, h: u32) -> RgbaImage {
    RgbaImage::from_fn(w, h, |x, y| Rgba([(x * 2) as u8, (y * 2) as u8, 77, 255]))
}

fn session_with(image: &RgbaImage) -> EditingSession {
    let mut stack = LayerStack::new(image.width(), image.height()).unwrap();
    stack.insert(0, paintcore::Layer::from_source("Photo", image).unwrap()).unwrap();
    EditingSession::from_stack("scenario", stack, &EngineSettings::default())
}

/// Confirm a modal filter with `input`.
fn apply_modal(session: &EditingSession, input: FilterInput) {
    let Invocation::Pending(mut pending) = session.invoke(&builtin(input.filter_id())).unwrap() else {
        panic!("{} should be modal", input.filter_id());
    };
    pending.update(input).unwrap();
    pending.confirm().unwrap();
    assert_eq!(pending.state(), PipelineState::Committed);
}

#[test]
fn instant_invert_on_opaque_layer() {
    let original = gradient_image(100, 100);
    let session = session_with(&original);
    assert!(matches!(session.invoke(&builtin(FilterId::Invert)).unwrap(), Invocation::Applied(_)));

    assert_eq!(session.history_len(), 1);
    let stack = session.read();
    let pixels = stack.layer(0).unwrap().pixels();
    for (x, y, p) in original.enumerate_pixels() {
        let q = pixels.get_pixel(x, y).unwrap();
        assert_eq!(q, Rgba([255 - p[0], 255 - p[1], 255 - p[2], p[3]]));
    }
}

#[test]
fn normal_opaque_layer_composites_to_itself() {
    let original = gradient_image(70, 90);
    let session = session_with(&original);
    let first = session.composite_image();
    assert_eq!(first, original);
    assert_eq!(session.composite_image(), first);
}

#[test]
fn undo_all_then_redo_all_reproduces_final_state() {
    let session = session_with(&gradient_image(40, 40));
    let initial = session.read().clone();

    session.invoke(&builtin(FilterId::Invert)).unwrap();
    apply_modal(
        &session,
        FilterInput::BrightnessContrast(BrightnessContrastInput { brightness: 0.2, contrast: 0.3 }),
    );
    session.add_layer("Shapes").unwrap();
    apply_modal(
        &session,
        FilterInput::Shape(ShapeParams {
            fill: Some(Rgb::new(0, 200, 0)),
            ..ShapeParams::new(ShapeKind::Ellipse, (5.0, 5.0), (30.0, 20.0))
        }),
    );
    session.set_layer_blend_mode(1, BlendMode::Multiply).unwrap();
    apply_modal(
        &session,
        FilterInput::Gradient(GradientParams { color: Rgb::new(255, 0, 0), x2: 40.0, y2: 40.0, ..Default::default() }),
    );
    let n = session.history_len();
    assert_eq!(n, 6);
    let final_state = session.read().clone();
    let final_image = session.composite_image();

    for _ in 0..n {
        assert!(session.undo().unwrap().is_some());
    }
    assert_eq!(session.undo().unwrap(), None);
    {
        let stack = session.read();
        assert_eq!(stack.len(), initial.len());
        assert_eq!(stack.layer(0).unwrap().pixels(), initial.layer(0).unwrap().pixels());
    }

    for _ in 0..n {
        assert!(session.redo().unwrap().is_some());
    }
    assert!(!session.can_redo());
    let stack = session.read();
    assert_eq!(stack.len(), final_state.len());
    for (a, b) in stack.layers().iter().zip(final_state.layers()) {
        assert_eq!(a.pixels(), b.pixels());
        assert_eq!(a.blend_mode, b.blend_mode);
    }
    drop(stack);
    assert_eq!(session.composite_image(), final_image);
}

#[test]
fn commit_after_undo_prunes_redo_branch() {
    let session = session_with(&gradient_image(8, 8));
    session.invoke(&builtin(FilterId::Invert)).unwrap();
    apply_modal(&session, FilterInput::Grayscale(Default::default()));
    session.undo().unwrap();
    assert!(session.can_redo());

    session.invoke(&builtin(FilterId::Invert)).unwrap();
    assert!(!session.can_redo());
    assert_eq!(session.redo().unwrap(), None);
    assert_eq!(session.undo_history(), ["Invert Colors", "Invert Colors"]);
}

#[test]
fn fixed_ratio_rect_through_pipeline_is_square() {
    let session = EditingSession::new_untitled(1, 32, 32, &EngineSettings::default()).unwrap();
    session.add_layer("Rect").unwrap();
    apply_modal(
        &session,
        FilterInput::Shape(ShapeParams {
            fill: Some(Rgb::BLACK),
            fixed_ratio: true,
            ..ShapeParams::new(ShapeKind::Rect, (2.0, 2.0), (12.0, 6.0))
        }),
    );
    let stack = session.read();
    let layer = stack.layer(1).unwrap().pixels();
    let opaque = (0..32).flat_map(|y| (0..32).map(move |x| (x, y))).filter(|&(x, y)| layer.get_pixel(x, y).unwrap()[3] == 255);
    assert_eq!(opaque.count(), 100);
}

#[test]
fn legacy_record_without_thumbnail_opens() {
    let session = session_with(&gradient_image(16, 16));
    let mut stored = session.to_storage(false).unwrap();
    assert!(stored.thumbnail.is_none());
    stored.layers[0].blend_mode = None;

    let reopened = EditingSession::from_storage("reopened", &stored, &EngineSettings::default()).unwrap();
    assert_eq!(reopened.composite_image(), session.composite_image());

    let with_thumb = session.to_storage(true).unwrap();
    let bytes = with_thumb.to_bytes().unwrap();
    assert!(StorageProject::from_bytes(&bytes).unwrap().thumbnail.is_some());
}

#[test]
fn cli_runs_filters_and_writes_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.png");
    write_png(&gradient_image(10, 6), &input).unwrap();
    let settings = EngineSettings::default();
    let steps = ["invert", "flip-horizontal"].map(|f| cli::parse_filter(f).unwrap());

    let png_out = dir.path().join("out.png");
    cli::run_one(&input, &png_out, &steps, OutputFormat::Png, true, &settings).unwrap();
    let flat = image::open(&png_out).unwrap().to_rgba8();
    let src = gradient_image(10, 6);
    let p = src.get_pixel(0, 3);
    assert_eq!(*flat.get_pixel(9, 3), Rgba([255 - p[0], 255 - p[1], 255 - p[2], 255]));

    let pcs_out = dir.path().join("out.pcs");
    cli::run_one(&input, &pcs_out, &steps, OutputFormat::Project, true, &settings).unwrap();
    let stack = load_layer_stack(&pcs_out).unwrap();
    assert_eq!(stack.composite_image(), flat);

    assert!(cli::run_one(&dir.path().join("missing.png"), &png_out, &[], OutputFormat::Png, false, &settings).is_err());
}
