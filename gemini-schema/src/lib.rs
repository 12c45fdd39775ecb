pub mod gemini;

pub use gemini::{
    Content, FunctionDeclaration, GeminiGenerateContentRequest, GeminiModel, GeminiModelList,
    GeminiResponseBody, GenerationConfig, Part, Tool, ToolConfig,
};
