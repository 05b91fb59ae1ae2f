mod chat;
mod product;

pub use chat::{Message, MessageRole, ToolCall, ToolResult, ToolSchema, WidgetConfig};
pub use product::Product;
