use lumen_app::outer_app::async_load_app::AsyncLoadApp;
use lumen_headless_app::app::HeadlessRunner;

fn main() -> anyhow::Result<()> {
    let outer_app = Box::new(AsyncLoadApp::default());
    HeadlessRunner::run(outer_app, "async_load.toml")
}
