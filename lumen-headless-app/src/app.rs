use std::path::PathBuf;

use anyhow::Context;

use lumen_app::config::AppConfig;
use lumen_app::outer_app::HeadlessApp;
use lumen_app::session::HeadlessSession;
use lumen_crate_tools::resource::LumenPath;

pub struct HeadlessRunner;

// 总的 main 函数
impl HeadlessRunner {
    /// 整个程序的入口
    ///
    /// 第一个命令行参数可以指定配置文件，否则使用 `config/<default_config>`
    pub fn run(outer_app: Box<dyn HeadlessApp>, default_config: &str) -> anyhow::Result<()> {
        HeadlessSession::init_env();

        let config_path = std::env::args()
            .nth(1)
            .map(PathBuf::from)
            .unwrap_or_else(|| LumenPath::config_path(default_config));
        let config = AppConfig::load(&config_path)?;

        let mut session = HeadlessSession::new(config, outer_app).context("failed to start session")?;
        let result = session.run().map(|report| report.frames.len());

        log::info!("end run.");
        let report = session.destroy();

        let frames = result?;
        if let Some(error) = &report.scene_error {
            log::warn!("scene failed to load: {}", error);
        }
        log::info!("{} frames rendered", frames);
        Ok(())
    }
}
