//! User interaction tools
//!
//! Both tools block their session through the pause protocol until the user
//! answers from the UI.

use serde_json::{Value, json};

use crate::error::ToolError;
use crate::pause::{PauseRequest, PauseResponse, pause_for_user};
use crate::tool_params;
use crate::tools::{BoxFuture, Tool, ToolContext, ToolOutput};

pub const CONFIRM_TOOL_NAME: &str = "confirm_action";
pub const WAIT_TOOL_NAME: &str = "wait_for_user";

fn message_param(params: &Value) -> Result<String, ToolError> {
    params
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ToolError::InvalidParams("message is required".to_string()))
}

fn details_param(params: &Value) -> Option<String> {
    params.get("details").and_then(Value::as_str).map(str::to_string)
}

/// Ask the user a yes/no question before continuing
pub struct ConfirmAction;

impl Tool for ConfirmAction {
    fn name(&self) -> &str {
        CONFIRM_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Ask the user to approve or deny an action before it is carried out."
    }

    fn parameters_schema(&self) -> Value {
        tool_params! {
            message: "string" => "The question shown to the user",
        }
    }

    fn execute(&self, params: Value, ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput, ToolError>> {
        Box::pin(async move {
            let message = message_param(&params)?;
            let mut request = PauseRequest::confirm(CONFIRM_TOOL_NAME, message);
            if let Some(details) = details_param(&params) {
                request = request.with_details(details);
            }

            ctx.progress("waiting for confirmation");
            match pause_for_user(request).await {
                PauseResponse::Approved | PauseResponse::Resumed => {
                    Ok(ToolOutput::success(json!({ "approved": true })))
                }
                PauseResponse::Denied => Err(ToolError::Rejected("user denied the action".to_string())),
                PauseResponse::Interrupted => Err(ToolError::ExecutionFailed(
                    "interrupted while waiting for confirmation".to_string(),
                )),
            }
        })
    }
}

/// Block until the user presses continue
pub struct WaitForUser;

impl Tool for WaitForUser {
    fn name(&self) -> &str {
        WAIT_TOOL_NAME
    }

    fn description(&self) -> &str {
        "Pause and wait until the user signals that the session may continue."
    }

    fn parameters_schema(&self) -> Value {
        tool_params! {
            message: "string" => "What the user should do before continuing",
        }
    }

    fn execute(&self, params: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolOutput, ToolError>> {
        Box::pin(async move {
            let message = message_param(&params)?;
            let response = pause_for_user(PauseRequest::continue_(WAIT_TOOL_NAME, message)).await;
            if response == PauseResponse::Interrupted {
                return Err(ToolError::ExecutionFailed(
                    "interrupted while waiting for the user".to_string(),
                ));
            }
            Ok(ToolOutput::success("continued"))
        })
    }
}
