#[derive(thiserror::Error, Debug)]
pub enum RenderGraphError {
    /// 参与循环的 pass 名称
    #[error("cycle detected involving passes: {0:?}")]
    Cycle(Vec<String>),

    #[error("pass {pass} uses a resource that was not imported into this graph")]
    UnknownResource { pass: String },

    #[error("explicit dependency references unknown pass {0}")]
    UnknownPass(String),
}
