use std::time::Instant;

use anyhow::Result;
use desktop_duplicator::{CaptureFrame, DuplicatorController, result_name};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let controller = DuplicatorController::instance();

    println!("duplication supported: {}", controller.is_supported());
    let (accurate, info) = controller.d3d_info();
    println!(
        "feature levels: 0x{:x}..0x{:x} (accurate: {accurate})",
        info.min_feature_level, info.max_feature_level
    );
    let dpi = controller.dpi();
    println!("dpi: {}x{}", dpi.x, dpi.y);

    let names = controller.device_names().unwrap_or_default();
    for (id, name) in names.iter().enumerate() {
        println!("monitor {id}: {name}");
    }

    let mut frame = CaptureFrame::new();

    let begin = Instant::now();
    let result = controller.duplicate(&mut frame);
    println!(
        "full desktop: {} ({}x{} in {:.3} ms, {} updated rect(s))",
        result_name(&result),
        frame.frame().size().width,
        frame.frame().size().height,
        begin.elapsed().as_secs_f64() * 1000.0,
        frame.frame().updated_region().rects().len(),
    );

    for id in 0..names.len() {
        let begin = Instant::now();
        let result = controller.duplicate_monitor(&mut frame, id);
        let origin = frame.frame().top_left();
        println!(
            "monitor {id}: {} ({}x{} at ({}, {}) in {:.3} ms)",
            result_name(&result),
            frame.frame().size().width,
            frame.frame().size().height,
            origin.x,
            origin.y,
            begin.elapsed().as_secs_f64() * 1000.0,
        );
    }

    controller.unregister(frame.context());
    Ok(())
}
