//! Functions the model may call, and their execution.

use crate::extract::{FunctionCall, extract};
use crate::quote::QuoteClient;
use serde_json::{Value, json};

pub const STOCK_PRICE: &str = "stock_price";
pub const CREATE_POLL: &str = "create_poll";

/// Function definitions advertised to the model in the system prompt.
pub fn function_definitions() -> Value {
    json!([
        {
            "name": STOCK_PRICE,
            "description": "Get the current stock price",
            "parameters": {
                "type": "object",
                "properties": {
                    "symbol": {"type": "string", "description": "The stock symbol, e.g. AAPL"}
                },
                "required": ["symbol"]
            }
        },
        {
            "name": CREATE_POLL,
            "description": "Create a new poll for gathering opinions",
            "parameters": {
                "type": "object",
                "properties": {
                    "question": {"type": "string", "description": "The question for the poll"},
                    "options": {
                        "type": "array",
                        "items": {"type": "string"},
                        "description": "The options for the poll"
                    }
                },
                "required": ["question", "options"]
            }
        }
    ])
}

/// Run a recovered call. Only `stock_price` has an implementation.
pub async fn execute(call: &FunctionCall, quotes: &QuoteClient) -> Option<String> {
    match call.name.as_str() {
        STOCK_PRICE => {
            let Some(symbol) = call.symbol() else {
                log::debug!("stock_price call without a symbol: {:?}", call.arguments);
                return None;
            };
            quotes.fetch_price(&symbol).await
        }
        other => {
            log::debug!("No implementation for function '{}'", other);
            None
        }
    }
}

/// Extract a call from raw model output and run it.
pub async fn respond_to(text: &str, quotes: &QuoteClient) -> Option<String> {
    let call = extract(text)?;
    log::debug!("Function call: {} {:?}", call.name, call.arguments);
    execute(&call, quotes).await
}
