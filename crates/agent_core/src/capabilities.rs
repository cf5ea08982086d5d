/// Static description of what a backend can do, independent of any one
/// invocation.
#[derive(Debug, Clone)]
pub struct Capabilities {
    pub supports_json: bool,
    pub supports_streaming: bool,
    pub supports_images: bool,
    pub supports_tools: bool,
    pub max_context_tokens: u64,
    pub max_output_tokens: u64,
    pub supported_models: Vec<String>,
    pub default_model: String,
}
