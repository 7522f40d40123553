use hbm::{
    Constraint, Description, Device, Extent, Flags, LogLevel, MemoryType, Usage, log_init,
};
use std::fs;
use std::os::unix::fs::MetadataExt;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== HBM Device Info ===");

    log_init(LogLevel::Info, None);

    // 1. Pick a DRM node: argv[1] or the first render node
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/dev/dri/renderD128".to_string());
    let dev_id = match fs::metadata(&path) {
        Ok(meta) => {
            println!("[+] Using {path}");
            Some(meta.rdev())
        }
        Err(e) => {
            println!("[!] {path}: {e}; using a node-less device");
            None
        }
    };

    // 2. Create the device
    let device = Device::create(dev_id, false)?;
    if let Some(node) = device.node() {
        println!(
            "    Node:    {}:{} ({})",
            node.major,
            node.minor,
            node.driver.as_deref().unwrap_or("unknown driver")
        );
    }
    println!("    Backend: {}", device.backend_name());

    // 3. Dump the capability table
    println!("\n[Formats]");
    let caps = device.capabilities();
    for format in caps.formats() {
        let desc = Description::image(Flags::empty(), format, Usage::GPU_TRANSFER);
        let mods: Vec<String> = device
            .modifiers(&desc)
            .into_iter()
            .map(|m| format!("{m} ({}p)", device.plane_count(format, m)))
            .collect();
        println!("    {format:<6} {}", mods.join(", "));
    }

    // 4. Negotiate a typical layout
    println!("\n[Layout] XRGB8888 1920x1080 sampled+color, 256-byte strides");
    let desc = Description::image(
        Flags::MAP | Flags::COPY,
        hbm::Format::XRGB8888,
        Usage::GPU_SAMPLED | Usage::GPU_COLOR,
    );
    let con = Constraint::default().stride_align(256);
    let extent = Extent::Image {
        width: 1920,
        height: 1080,
    };
    match device.create_bo(&desc, &extent, Some(&con)) {
        Ok(bo) => {
            let layout = bo.layout();
            println!("    Modifier: {}", layout.modifier);
            println!("    Size:     {} bytes", layout.size);
            for plane in 0..layout.plane_count as usize {
                println!(
                    "    Plane {plane}:  offset {:>9}  stride {:>6}",
                    layout.offsets[plane], layout.strides[plane]
                );
            }
            let mts: Vec<String> = bo
                .memory_types()
                .iter()
                .map(|mt: &MemoryType| format!("{mt:?}"))
                .collect();
            println!("    Memory:   {}", mts.join(" | "));
        }
        Err(e) => println!("    FAILED: {e}"),
    }

    Ok(())
}
