use hbm::kernel::memfd;
use hbm::{
    BoState, Capabilities, Config, Constraint, Description, Device, DeviceBuilder, DeviceProfile,
    ErrorKind, Extent, Flags, Format, MemoryType, Modifier, ModifierCaps, Usage,
};
use std::os::fd::{AsFd, AsRawFd};

fn device(profile: DeviceProfile) -> Device {
    DeviceBuilder::new()
        .config(Config::new().debug(true).profile(profile))
        .build()
        .unwrap()
}

fn image(format: Format, usage: Usage) -> Description {
    Description::image(Flags::MAP | Flags::COPY, format, usage)
}

const fn extent(width: u32, height: u32) -> Extent {
    Extent::Image { width, height }
}

#[test]
fn modifier_queries_are_consistent() {
    let dev = device(DeviceProfile::Intel);
    for format in dev.capabilities().formats().collect::<Vec<_>>() {
        for usage in [Usage::GPU_SAMPLED, Usage::GPU_STORAGE, Usage::GPU_SCANOUT_HACK] {
            let desc = image(format, usage);
            let count = dev.enumerate_modifiers(&desc, &mut []);
            let mut mods = vec![Modifier::INVALID; count];
            assert_eq!(dev.enumerate_modifiers(&desc, &mut mods), count);
            assert_eq!(dev.enumerate_modifiers(&desc, &mut []), count);
            assert_eq!(mods, dev.modifiers(&desc));
            for m in &mods {
                assert!(dev.has_modifier(&desc, *m));
                assert!(dev.plane_count(format, *m) >= 1);
            }
        }
    }
}

#[test]
fn explicit_unsupported_modifier_fails_at_creation() {
    let dev = device(DeviceProfile::Linear);
    let desc = image(Format::ARGB8888, Usage::GPU_SAMPLED).with_modifier(Modifier::I915_Y_TILED);
    assert!(!dev.has_modifier(&desc, Modifier::I915_Y_TILED));
    let err = dev.create_bo(&desc, &extent(64, 64), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Contract);
}

#[test]
fn extent_must_match_the_description() {
    let dev = device(DeviceProfile::Linear);
    let desc = image(Format::R8, Usage::GPU_SAMPLED);
    let err = dev
        .create_bo(&desc, &Extent::Buffer { size: 64 }, None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Contract);
}

#[test]
fn negotiated_layouts_honor_constraints() {
    let dev = device(DeviceProfile::Intel);
    let con = Constraint::default()
        .offset_align(4096)
        .stride_align(256)
        .size_align(65536);

    for (format, usage) in [
        (Format::NV12, Usage::GPU_SAMPLED),
        (Format::P010, Usage::GPU_SAMPLED),
        (Format::YUV420, Usage::GPU_TRANSFER),
        (Format::ABGR16161616F, Usage::GPU_COLOR),
        (Format::RGB565, Usage::GPU_STORAGE),
    ] {
        let bo = dev
            .create_bo(&image(format, usage), &extent(1001, 333), Some(&con))
            .unwrap();
        let layout = bo.layout();
        assert_eq!(layout.size % 65536, 0);
        assert_eq!(layout.plane_count, dev.plane_count(format, layout.modifier));
        for plane in 0..layout.plane_count as usize {
            assert_eq!(layout.offsets[plane] % 4096, 0);
            assert_eq!(layout.strides[plane] % 256, 0);
            if plane > 0 {
                assert!(layout.offsets[plane] > layout.offsets[plane - 1]);
            }
        }
    }
}

#[test]
fn no_compression_and_allow_lists() {
    let dev = device(DeviceProfile::Intel);

    let auto = image(Format::ABGR8888, Usage::GPU_SAMPLED);
    let bo = dev.create_bo(&auto, &extent(256, 256), None).unwrap();
    assert_eq!(bo.layout().modifier, Modifier::I915_Y_TILED_CCS);
    assert_eq!(bo.layout().plane_count, 2);

    let plain = Description::image(Flags::NO_COMPRESSION, Format::ABGR8888, Usage::GPU_SAMPLED);
    let bo = dev.create_bo(&plain, &extent(256, 256), None).unwrap();
    assert_eq!(bo.layout().modifier, Modifier::I915_Y_TILED);

    let con = Constraint::default().modifiers(vec![Modifier::LINEAR, Modifier::I915_Y_TILED_CCS]);
    let bo = dev.create_bo(&plain, &extent(256, 256), Some(&con)).unwrap();
    assert_eq!(bo.layout().modifier, Modifier::LINEAR);

    let con = Constraint::default().modifiers(vec![Modifier(0x1234)]);
    let err = dev.create_bo(&auto, &extent(256, 256), Some(&con)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
}

#[test]
fn no_compression_queries_match_creation() {
    let dev = device(DeviceProfile::Intel);
    let desc = Description::image(Flags::NO_COMPRESSION, Format::XRGB8888, Usage::GPU_SAMPLED);

    let mods = dev.modifiers(&desc);
    assert!(!mods.contains(&Modifier::I915_Y_TILED_CCS));
    assert!(!dev.has_modifier(&desc, Modifier::I915_Y_TILED_CCS));
    assert_eq!(dev.enumerate_modifiers(&desc, &mut []), mods.len());

    for m in mods {
        let con = Constraint::default().modifiers(vec![m]);
        let bo = dev.create_bo(&desc, &extent(128, 128), Some(&con)).unwrap();
        assert_eq!(bo.layout().modifier, m);
    }

    let con = Constraint::default().modifiers(vec![Modifier::I915_Y_TILED_CCS]);
    let err = dev.create_bo(&desc, &extent(128, 128), Some(&con)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
}

#[test]
fn caller_layouts_are_validated() {
    let dev = device(DeviceProfile::Intel);
    let desc = image(Format::XRGB8888, Usage::GPU_SAMPLED);
    let ext = extent(300, 200);
    let reference = dev.create_bo(&desc, &ext, None).unwrap();
    let layout = *reference.layout();

    let bo = dev.create_bo_with_layout(&desc, &ext, &layout, None).unwrap();
    assert_eq!(*bo.layout(), layout);
    assert_eq!(bo.state(), BoState::Created);

    let mut bad = layout;
    bad.strides[0] = 4;
    let err = dev.create_bo_with_layout(&desc, &ext, &bad, None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Contract);

    let mut foreign = layout;
    foreign.modifier = Modifier(0xdead);
    assert!(dev.create_bo_with_layout(&desc, &ext, &foreign, None).is_err());
}

#[test]
fn borrowed_dma_buf_restricts_creation() {
    let dev = device(DeviceProfile::Linear);
    let desc = Description::image(Flags::EXTERNAL | Flags::MAP, Format::R8, Usage::GPU_SAMPLED);
    let ext = extent(64, 64);
    let layout = *dev.create_bo(&desc, &ext, None).unwrap().layout();
    assert_eq!(layout.size, 4096);

    let small = memfd::create("hbm-test-small", 1024).unwrap();
    let err = dev
        .create_bo_with_layout(&desc, &ext, &layout, Some(small.as_fd()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Contract);

    let fd = memfd::create("hbm-test-fit", 4096).unwrap();
    let mut bo = dev
        .create_bo_with_layout(&desc, &ext, &layout, Some(fd.as_fd()))
        .unwrap();
    // borrowed, so still ours
    assert!(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) } >= 0);

    let mt = bo.memory_types()[0];
    bo.bind_memory(mt, Some(fd)).unwrap();
    assert_eq!(bo.state(), BoState::Bound);
}

#[test]
fn local_only_tilings_need_local_memory() {
    let caps = Capabilities::new().with_format(
        Format::R8,
        &[ModifierCaps::new(Modifier::I915_Y_TILED, Usage::IMAGE_MASK).local_only()],
    );
    let dev = DeviceBuilder::new().capabilities(caps).build().unwrap();

    // system memory is never device-local
    let err = dev
        .create_bo(&image(Format::R8, Usage::GPU_SAMPLED), &extent(16, 16), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capability);
}

#[test]
fn scanout_images_avoid_non_coherent_memory() {
    let dev = device(DeviceProfile::Intel);
    let bo = dev
        .create_bo(
            &Description::image(Flags::empty(), Format::XRGB8888, Usage::GPU_SCANOUT_HACK),
            &extent(640, 480),
            None,
        )
        .unwrap();
    assert!(bo.memory_types().iter().all(|mt| {
        !mt.contains(MemoryType::CACHED) || mt.contains(MemoryType::COHERENT)
    }));
}
