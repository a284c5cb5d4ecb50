//! LLM 层：流式生成抽象、内嵌工具调用解码、按角色选择后端、Mock

pub mod inline;
pub mod mock;
pub mod profiles;
pub mod traits;

pub use inline::{decode_inline, InlineToolCallBackend, InlineToolCallDecoder};
pub use mock::{MockLlmClient, Script, ScriptedLlm, Step};
pub use profiles::LlmProfiles;
pub use traits::{
    ChatRole, ChatTurn, GenerationEvent, GenerationStream, LlmBackend, Prompt, TextLlm,
    TextStream, ToolCallRequest, ToolDefinition,
};
