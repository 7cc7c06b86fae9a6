use lumen_app::outer_app::procedural_app::ProceduralApp;
use lumen_headless_app::app::HeadlessRunner;

fn main() -> anyhow::Result<()> {
    let outer_app = Box::new(ProceduralApp::default());
    HeadlessRunner::run(outer_app, "headless.toml")
}
