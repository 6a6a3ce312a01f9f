// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use colloquy_model::ToolResult;

use crate::Tool;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: u64,
    pub title: String,
    pub done: bool,
}

/// System tool for in-conversation task tracking.
///
/// The model maintains a running checklist across turns: `add` new items,
/// `complete` finished ones, `list` the current state.  State lives with the
/// registry instance, which the engine scopes per server process.
#[derive(Default)]
pub struct TaskListTool {
    tasks: Mutex<Vec<TaskItem>>,
    next_id: Mutex<u64>,
}

#[async_trait]
impl Tool for TaskListTool {
    fn name(&self) -> &str {
        "task_list"
    }

    fn description(&self) -> &str {
        "Track multi-step work as a checklist.\n\
         action=add: add a task (title required)\n\
         action=complete: mark a task done (id required)\n\
         action=list: show all tasks"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "complete", "list"]
                },
                "title": {
                    "type": "string",
                    "description": "Task title (for action=add)"
                },
                "id": {
                    "type": "integer",
                    "description": "Task id (for action=complete)"
                }
            },
            "required": ["action"],
            "additionalProperties": false
        })
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn is_system(&self) -> bool {
        true
    }

    async fn execute(&self, arguments: &Value) -> ToolResult {
        match arguments.get("action").and_then(|v| v.as_str()) {
            Some("add") => {
                let Some(title) = arguments.get("title").and_then(|v| v.as_str()) else {
                    return ToolResult::failure("action=add requires 'title'");
                };
                let mut next = self.next_id.lock().unwrap();
                *next += 1;
                let item = TaskItem {
                    id: *next,
                    title: title.to_string(),
                    done: false,
                };
                self.tasks.lock().unwrap().push(item.clone());
                ToolResult::success(format!("added task {}: {}", item.id, item.title))
            }
            Some("complete") => {
                let Some(id) = arguments.get("id").and_then(|v| v.as_u64()) else {
                    return ToolResult::failure("action=complete requires 'id'");
                };
                let mut tasks = self.tasks.lock().unwrap();
                match tasks.iter_mut().find(|t| t.id == id) {
                    Some(t) => {
                        t.done = true;
                        ToolResult::success(format!("completed task {id}"))
                    }
                    None => ToolResult::failure(format!("no task with id {id}")),
                }
            }
            Some("list") => {
                let tasks = self.tasks.lock().unwrap();
                if tasks.is_empty() {
                    return ToolResult::success("no tasks");
                }
                let lines: Vec<String> = tasks
                    .iter()
                    .map(|t| {
                        format!("[{}] {} {}", if t.done { "x" } else { " " }, t.id, t.title)
                    })
                    .collect();
                ToolResult::success(lines.join("\n"))
            }
            _ => ToolResult::failure("unknown action; expected add, complete, or list"),
        }
    }
}
