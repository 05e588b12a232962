use std::cell::RefCell;
use std::rc::Rc;

use zoetrope::{
    BatchRenderer, BatchUpload, CacheSpec, DriverLimits, Filter, GpuDriver, GpuTextureHandle,
    NodeId, ProgramHandle, RendererOpts, Rgba8Premul, Scene, SourceId, SurfaceSize, ZoetropeError,
    ZoetropeResult,
};

/// Driver calls the cache machinery produces, with the projection row that
/// tells a flipped render-target pass from an output pass.
#[derive(Clone, Debug, PartialEq)]
enum Event {
    Compile { label: String },
    CreateTexture { handle: u64, width: u32, height: u32 },
    CreateTarget { handle: u64, width: u32, height: u32 },
    Upload { handle: u64 },
    Destroy { handle: u64 },
    SetViewport { width: u32, height: u32 },
    BindTarget { target: Option<u64> },
    Clear { color: Rgba8Premul },
    Draw { program: u32, vertex_count: usize, slots: Vec<u64>, proj_y: f32 },
    ReadPixels { target: Option<u64>, width: u32, height: u32 },
}

type Log = Rc<RefCell<Vec<Event>>>;

struct RecordingDriver {
    log: Log,
    /// Labels whose programs refuse to compile.
    fail_labels: Vec<&'static str>,
    next_handle: u64,
    next_program: u32,
}

impl RecordingDriver {
    fn new(log: Log) -> Self {
        Self {
            log,
            fail_labels: Vec::new(),
            next_handle: 1,
            next_program: 0,
        }
    }

    fn record(&self, event: Event) {
        self.log.borrow_mut().push(event);
    }
}

impl GpuDriver for RecordingDriver {
    fn limits(&self) -> DriverLimits {
        DriverLimits {
            max_texture_size: 4096,
            max_texture_slots: 8,
        }
    }

    fn compile_program(
        &mut self,
        label: &str,
        _vertex: &str,
        _fragment: &str,
        _texture_count: usize,
    ) -> ZoetropeResult<ProgramHandle> {
        self.record(Event::Compile {
            label: label.to_owned(),
        });
        if self.fail_labels.contains(&label) {
            return Err(ZoetropeError::render("shader refused to compile"));
        }
        let program = ProgramHandle(self.next_program);
        self.next_program += 1;
        Ok(program)
    }

    fn create_texture(&mut self, width: u32, height: u32) -> ZoetropeResult<GpuTextureHandle> {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.record(Event::CreateTexture {
            handle,
            width,
            height,
        });
        Ok(GpuTextureHandle(handle))
    }

    fn create_render_target(
        &mut self,
        width: u32,
        height: u32,
    ) -> ZoetropeResult<GpuTextureHandle> {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.record(Event::CreateTarget {
            handle,
            width,
            height,
        });
        Ok(GpuTextureHandle(handle))
    }

    fn upload_pixels(
        &mut self,
        handle: GpuTextureHandle,
        _width: u32,
        _height: u32,
        _pixels: &[u8],
    ) -> ZoetropeResult<()> {
        self.record(Event::Upload { handle: handle.0 });
        Ok(())
    }

    fn destroy_texture(&mut self, handle: GpuTextureHandle) {
        self.record(Event::Destroy { handle: handle.0 });
    }

    fn set_viewport(&mut self, width: u32, height: u32) {
        self.record(Event::SetViewport { width, height });
    }

    fn bind_target(&mut self, target: Option<GpuTextureHandle>) {
        self.record(Event::BindTarget {
            target: target.map(|t| t.0),
        });
    }

    fn clear(&mut self, color: Rgba8Premul) -> ZoetropeResult<()> {
        self.record(Event::Clear { color });
        Ok(())
    }

    fn draw(&mut self, upload: &BatchUpload<'_>) -> ZoetropeResult<()> {
        self.record(Event::Draw {
            program: upload.program.0,
            vertex_count: upload.vertex_count,
            slots: upload.slots.iter().map(|s| s.0).collect(),
            proj_y: upload.projection[5],
        });
        Ok(())
    }

    fn read_pixels(
        &mut self,
        target: Option<GpuTextureHandle>,
        width: u32,
        height: u32,
    ) -> ZoetropeResult<Vec<u8>> {
        self.record(Event::ReadPixels {
            target: target.map(|t| t.0),
            width,
            height,
        });
        Ok(vec![0; (width as usize) * (height as usize) * 4])
    }
}

const PASS_BODY: &str = "    return textureSampleLevel(cover_texture, cover_sampler, in.uv, 0.0);";

fn renderer() -> (BatchRenderer, Log) {
    renderer_with_driver(|_| {})
}

fn renderer_with_driver(tweak: impl FnOnce(&mut RecordingDriver)) -> (BatchRenderer, Log) {
    let log: Log = Rc::new(RefCell::new(Vec::new()));
    let mut driver = RecordingDriver::new(Rc::clone(&log));
    tweak(&mut driver);
    let size = SurfaceSize {
        width: 64,
        height: 64,
    };
    let renderer = BatchRenderer::new(Box::new(driver), size, RendererOpts::default()).unwrap();
    (renderer, log)
}

fn bitmap_scene(width: u32, height: u32) -> (Scene, NodeId, SourceId) {
    let mut scene = Scene::new();
    let source = scene.sources_mut().register_pending("content.png");
    let pixels = vec![255u8; (width * height * 4) as usize];
    scene
        .sources_mut()
        .mark_loaded(source, width, height, pixels)
        .unwrap();
    let node = scene.new_bitmap(source);
    scene.add_child(scene.root(), node).unwrap();
    (scene, node, source)
}

fn content(scene: &Scene, id: NodeId) -> Option<u64> {
    scene
        .node(id)
        .and_then(|n| n.cache.as_ref())
        .and_then(|c| c.content_texture())
        .map(|t| t.index() as u64)
}

fn draws(log: &Log) -> Vec<Event> {
    log.borrow()
        .iter()
        .filter(|e| matches!(e, Event::Draw { .. }))
        .cloned()
        .collect()
}

fn target_count(log: &Log) -> usize {
    log.borrow()
        .iter()
        .filter(|e| matches!(e, Event::CreateTarget { .. }))
        .count()
}

#[test]
fn cache_pass_draws_into_a_bound_target_and_restores_the_surface() {
    let (mut renderer, log) = renderer();
    let (mut scene, node, _) = bitmap_scene(2, 2);

    renderer
        .cache_node(&mut scene, node, CacheSpec::new(0.0, 0.0, 2.0, 2.0))
        .unwrap();

    let events = log.borrow();
    let start = events
        .iter()
        .position(|e| matches!(e, Event::CreateTarget { .. }))
        .unwrap();
    let expected = vec![
        Event::CreateTarget {
            handle: 2,
            width: 2,
            height: 2,
        },
        Event::BindTarget { target: Some(2) },
        Event::SetViewport {
            width: 2,
            height: 2,
        },
        Event::Clear {
            color: Rgba8Premul::transparent(),
        },
        Event::CreateTexture {
            handle: 3,
            width: 2,
            height: 2,
        },
        Event::Upload { handle: 3 },
        Event::Draw {
            program: 0,
            vertex_count: 6,
            slots: vec![3, 1, 1, 1, 1, 1, 1, 1],
            proj_y: 1.0,
        },
        Event::BindTarget { target: None },
        Event::SetViewport {
            width: 64,
            height: 64,
        },
    ];
    assert_eq!(&events[start..], expected.as_slice());
}

#[test]
fn cache_passes_flip_the_projection_and_output_passes_do_not() {
    let (mut renderer, log) = renderer();
    let (mut scene, node, _) = bitmap_scene(2, 2);

    renderer
        .cache_node(&mut scene, node, CacheSpec::new(0.0, 0.0, 2.0, 2.0))
        .unwrap();
    renderer.render(&scene).unwrap();

    let draws = draws(&log);
    assert_eq!(draws.len(), 2);
    let Event::Draw { proj_y: cache_y, .. } = &draws[0] else {
        unreachable!()
    };
    let Event::Draw { proj_y: output_y, .. } = &draws[1] else {
        unreachable!()
    };
    assert!(*cache_y > 0.0, "render-target pass should flip vertically");
    assert!(*output_y < 0.0, "output pass keeps the top-left origin");
}

#[test]
fn cached_subtree_collapses_to_one_card() {
    let (mut renderer, log) = renderer();
    let mut scene = Scene::new();
    let group = scene.new_container();
    scene.add_child(scene.root(), group).unwrap();
    for (key, x) in [("a.png", 0.0), ("b.png", 2.0)] {
        let source = scene.sources_mut().register_pending(key);
        scene
            .sources_mut()
            .mark_loaded(source, 2, 2, vec![255u8; 16])
            .unwrap();
        let child = scene.new_bitmap(source);
        scene.node_mut(child).unwrap().transform.x = x;
        scene.add_child(group, child).unwrap();
    }

    renderer
        .cache_node(&mut scene, group, CacheSpec::new(0.0, 0.0, 4.0, 2.0))
        .unwrap();
    let after_cache = renderer.stats();
    assert_eq!(after_cache.cards_drawn, 2);
    assert_eq!(after_cache.draw_calls, 1);

    renderer.render(&scene).unwrap();
    let stats = renderer.stats();
    assert_eq!(stats.cards_drawn, 3, "the subtree should draw as one card");
    assert_eq!(stats.draw_calls, 2);

    // The output card samples the cache target, not the child textures.
    let rt = log
        .borrow()
        .iter()
        .find_map(|e| match e {
            Event::CreateTarget { handle, .. } => Some(*handle),
            _ => None,
        })
        .unwrap();
    let Event::Draw { slots, .. } = draws(&log).pop().unwrap() else {
        unreachable!()
    };
    assert!(slots.contains(&rt));
}

#[test]
fn cache_updates_ping_pong_between_two_stable_targets() {
    let (mut renderer, log) = renderer();
    let (mut scene, node, _) = bitmap_scene(2, 2);
    let spec = CacheSpec::new(0.0, 0.0, 2.0, 2.0);

    renderer.cache_node(&mut scene, node, spec).unwrap();
    let first = content(&scene, node);
    assert!(first.is_some());

    renderer.update_cache(&mut scene, node).unwrap();
    let second = content(&scene, node);
    assert_ne!(first, second);

    renderer.update_cache(&mut scene, node).unwrap();
    assert_eq!(content(&scene, node), first);

    assert_eq!(target_count(&log), 2, "updates must reuse the two targets");
    let cache = scene.node(node).unwrap().cache.as_ref().unwrap();
    assert_eq!(cache.cache_id, 3);
}

#[test]
fn filters_run_as_cover_passes_after_the_content_pass() {
    let (mut renderer, log) = renderer();
    let (mut scene, node, _) = bitmap_scene(2, 2);
    let mut spec = CacheSpec::new(0.0, 0.0, 2.0, 2.0);
    spec.filters = vec![Filter {
        label: "wash".into(),
        fragment: PASS_BODY.into(),
        second_pass: Some(PASS_BODY.into()),
    }];

    renderer.cache_node(&mut scene, node, spec).unwrap();

    let labels: Vec<String> = log
        .borrow()
        .iter()
        .filter_map(|e| match e {
            Event::Compile { label } => Some(label.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(labels, vec!["batch", "cover", "wash", "wash#2"]);

    // Content pass, then one single-texture cover per filter body, each
    // sampling the other target of the ping-pong pair.
    let draws = draws(&log);
    assert_eq!(draws.len(), 3);
    let Event::Draw { slots: wash, .. } = &draws[1] else {
        unreachable!()
    };
    let Event::Draw { slots: second, .. } = &draws[2] else {
        unreachable!()
    };
    assert_eq!(wash.len(), 1);
    assert_eq!(second.len(), 1);
    assert_ne!(wash, second);

    // Redrawing reuses the compiled filter programs.
    renderer.update_cache(&mut scene, node).unwrap();
    let washes = log
        .borrow()
        .iter()
        .filter(|e| matches!(e, Event::Compile { label } if label == "wash"))
        .count();
    assert_eq!(washes, 1);
}

#[test]
fn broken_filter_is_skipped_and_the_cache_survives() {
    let (mut renderer, log) = renderer_with_driver(|d| d.fail_labels = vec!["broken"]);
    let (mut scene, node, _) = bitmap_scene(2, 2);
    let mut spec = CacheSpec::new(0.0, 0.0, 2.0, 2.0);
    spec.filters = vec![
        Filter {
            label: "wash".into(),
            fragment: PASS_BODY.into(),
            second_pass: None,
        },
        Filter {
            label: "broken".into(),
            fragment: PASS_BODY.into(),
            second_pass: None,
        },
    ];

    renderer.cache_node(&mut scene, node, spec).unwrap();

    assert_eq!(draws(&log).len(), 2, "content pass plus the working filter");
    let cache = scene.node(node).unwrap().cache.as_ref().unwrap();
    assert!(cache.content_texture().is_some());
    assert_eq!(cache.cache_id, 1);
}

#[test]
fn cache_readback_uses_the_scaled_store_size() {
    let (mut renderer, log) = renderer();
    let (mut scene, node, _) = bitmap_scene(2, 2);
    let mut spec = CacheSpec::new(0.0, 0.0, 3.3, 2.1);
    spec.scale = 2.0;

    renderer.cache_node(&mut scene, node, spec).unwrap();
    let pixmap = renderer.cache_to_pixmap(&scene, node).unwrap();

    assert_eq!((pixmap.width(), pixmap.height()), (7, 5));
    let events = log.borrow();
    assert!(events.contains(&Event::CreateTarget {
        handle: 2,
        width: 7,
        height: 5,
    }));
    assert!(events.contains(&Event::ReadPixels {
        target: Some(2),
        width: 7,
        height: 5,
    }));
}

#[test]
fn uncache_destroys_both_targets_and_live_content_returns() {
    let (mut renderer, log) = renderer();
    let (mut scene, node, source) = bitmap_scene(2, 2);
    let spec = CacheSpec::new(0.0, 0.0, 2.0, 2.0);

    renderer.cache_node(&mut scene, node, spec).unwrap();
    renderer.update_cache(&mut scene, node).unwrap();

    renderer.uncache(&mut scene, node);
    assert!(scene.node(node).unwrap().cache.is_none());
    let destroyed = log
        .borrow()
        .iter()
        .filter(|e| matches!(e, Event::Destroy { .. }))
        .count();
    assert_eq!(destroyed, 2);
    assert!(
        renderer
            .texture_store()
            .texture_for_source(source)
            .is_some(),
        "the content texture outlives the cache"
    );

    let before = renderer.stats().cards_drawn;
    renderer.render(&scene).unwrap();
    assert_eq!(renderer.stats().cards_drawn, before + 1);
}
