use zoetrope::{
    Ease, Pixmap, RendererOpts, Rgba8Premul, Scene, Stage, SurfaceSize, TargetId, Tween, Tweens,
    props,
};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut scene = Scene::new();
    let mut dot = Pixmap::new(8, 8)?;
    dot.fill(Rgba8Premul {
        r: 240,
        g: 80,
        b: 40,
        a: 255,
    });
    let source = scene.sources_mut().register_pixmap("dot", &dot);
    let node = scene.new_bitmap(source);
    scene.add_child(scene.root(), node)?;

    let mut tweens = Tweens::new();
    tweens.add(
        Tween::new(TargetId::from(node)).to(props([("x", 48.0), ("y", 24.0)]), 500.0, Ease::OutQuad),
        &mut scene,
    )?;

    let size = SurfaceSize {
        width: 64,
        height: 64,
    };
    let mut stage = Stage::software(size, RendererOpts::default())?;

    for frame in 0..30u64 {
        stage.update(&mut scene, &mut tweens, 1000.0 / 60.0, false)?;
        let t = scene.node(node).map(|n| &n.transform);
        let (x, y) = t.map(|t| (t.x, t.y)).unwrap_or_default();
        println!("frame {frame}: dot at ({x:.1}, {y:.1})");
    }

    Ok(())
}
