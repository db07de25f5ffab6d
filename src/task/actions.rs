//! 动作处理器
//!
//! 每种动作一个处理器，统一走 ActionHandler 特征。文件类动作在返回时
//! 附带撤销动作，执行引擎据此写回滚日志。注册表在启动时校验覆盖了
//! 全部动作种类，缺一个就拒绝起服务。

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::core::error::BridgeError;
use crate::llm::{Message, TextGenerator};
use crate::task::types::{ActionKind, UndoAction};
use crate::tools::{SafeFs, ShellRunner};

const EDIT_PROMPT: &str =
    "You are a precise code editor. Apply the requested edit and return the complete updated file content with no commentary.";
const ANALYZE_PROMPT: &str =
    "You are a senior code reviewer. Analyze the given code and report findings concisely.";
const REFACTOR_PROMPT: &str =
    "You are a careful refactoring assistant. Preserve behavior exactly and return the complete updated file content with no commentary.";
const GENERATE_PROMPT: &str =
    "You are a code generator. Produce only the requested code with no commentary.";
const CUSTOM_PROMPT: &str =
    "You are a capable engineering assistant. Complete the task described by the user and report the outcome.";

/// 处理器共享的执行环境
pub struct ActionContext {
    pub fs: SafeFs,
    pub shell: ShellRunner,
    pub generator: Arc<dyn TextGenerator>,
}

impl ActionContext {
    pub fn new(fs: SafeFs, shell: ShellRunner, generator: Arc<dyn TextGenerator>) -> Self {
        Self { fs, shell, generator }
    }
}

/// 单步执行产物：对外输出 + 可选撤销动作
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub output: Value,
    pub undo: Option<UndoAction>,
}

impl ActionOutcome {
    pub fn value(output: Value) -> Self {
        Self { output, undo: None }
    }

    pub fn text(output: impl Into<String>) -> Self {
        Self::value(json!({ "output": output.into() }))
    }

    pub fn with_undo(mut self, undo: UndoAction) -> Self {
        self.undo = Some(undo);
        self
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn kind(&self) -> ActionKind;

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError>;
}

#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同种动作重复注册时后者覆盖前者，方便测试替换
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: ActionKind) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// 全部动作种类都要有处理器
    pub fn validate_complete(&self) -> Result<(), BridgeError> {
        let missing: Vec<&str> = ActionKind::ALL
            .iter()
            .filter(|kind| !self.handlers.contains_key(kind))
            .map(|kind| kind.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::Validation(format!(
                "missing action handlers: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ReadFileHandler));
        registry.register(Arc::new(WriteFileHandler));
        registry.register(Arc::new(EditFileHandler));
        registry.register(Arc::new(DeleteFileHandler));
        registry.register(Arc::new(CreateDirectoryHandler));
        registry.register(Arc::new(RunCommandHandler));
        registry.register(Arc::new(SearchCodebaseHandler));
        registry.register(Arc::new(AnalyzeCodeHandler));
        registry.register(Arc::new(RefactorCodeHandler));
        registry.register(Arc::new(GenerateCodeHandler));
        registry.register(Arc::new(RunTestsHandler));
        registry.register(Arc::new(GitCommitHandler));
        registry.register(Arc::new(CustomHandler));
        registry
    }
}

fn require_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, BridgeError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| BridgeError::Validation(format!("missing required param: {key}")))
}

fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.trim().is_empty())
}

fn first_str<'a>(params: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| optional_str(params, key))
}

/// 去掉 ``` 围栏，语言标记行一并丢弃
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let body = match rest.split_once('\n') {
        Some((_lang, body)) => body,
        None => return trimmed.to_string(),
    };
    match body.rfind("```") {
        Some(idx) => body[..idx].trim_end().to_string(),
        None => body.trim_end().to_string(),
    }
}

fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.trim().to_string();
    }
    let clipped: String = text.chars().skip(count - max_chars).collect();
    format!("...{}", clipped.trim())
}

/// 精确匹配优先，找不到再退一步忽略前导空白逐行比对
fn splice_replacement(content: &str, find: &str, replace: &str) -> Option<String> {
    if let Some(pos) = content.find(find) {
        return Some(format!(
            "{}{}{}",
            &content[..pos],
            replace,
            &content[pos + find.len()..]
        ));
    }

    let find_lines: Vec<&str> = find.lines().collect();
    if find_lines.is_empty() {
        return None;
    }

    // 行起点是原文里的真实字节偏移，\n 和 \r\n 行尾不参与比对但原样保留，
    // 切片永远落在行界上
    let mut line_starts = Vec::new();
    let mut content_lines = Vec::new();
    let mut offset = 0;
    for chunk in content.split_inclusive('\n') {
        line_starts.push(offset);
        let line = chunk
            .strip_suffix('\n')
            .map(|rest| rest.strip_suffix('\r').unwrap_or(rest))
            .unwrap_or(chunk);
        content_lines.push(line);
        offset += chunk.len();
    }

    for start in 0..content_lines.len() {
        if start + find_lines.len() > content_lines.len() {
            break;
        }
        let matched = find_lines
            .iter()
            .enumerate()
            .all(|(offset, find_line)| content_lines[start + offset].trim_start() == find_line.trim_start());
        if !matched {
            continue;
        }
        let last = start + find_lines.len() - 1;
        let end = line_starts[last] + content_lines[last].len();
        return Some(format!(
            "{}{}{}",
            &content[..line_starts[start]],
            replace,
            &content[end..]
        ));
    }
    None
}

pub struct ReadFileHandler;

#[async_trait]
impl ActionHandler for ReadFileHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::ReadFile
    }

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError> {
        let path = require_str(params, "path")?;
        let content = ctx.fs.read(path).await?;
        Ok(ActionOutcome::value(json!({ "path": path, "content": content })))
    }
}

pub struct WriteFileHandler;

#[async_trait]
impl ActionHandler for WriteFileHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::WriteFile
    }

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError> {
        let path = require_str(params, "path")?;
        let content = params.get("content").and_then(|v| v.as_str()).unwrap_or_default();

        // 覆写前留底，新建文件的撤销则是删掉它
        let prior = if ctx.fs.exists(path).await {
            Some(ctx.fs.read(path).await?)
        } else {
            None
        };
        ctx.fs.write(path, content).await?;

        let undo = match prior {
            Some(prior) => UndoAction::RestoreFile {
                path: path.to_string(),
                prior,
            },
            None => UndoAction::RemoveFile {
                path: path.to_string(),
            },
        };
        Ok(ActionOutcome::value(json!({ "path": path, "bytesWritten": content.len() })).with_undo(undo))
    }
}

pub struct EditFileHandler;

#[async_trait]
impl ActionHandler for EditFileHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::EditFile
    }

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError> {
        let path = require_str(params, "path")?;
        let prior = ctx.fs.read(path).await?;

        let find = first_str(params, &["find", "oldString", "old_string"]);
        // replace 允许为空串（等价于删除片段），不能用非空过滤
        let replace = ["replace", "newString", "new_string"]
            .iter()
            .find_map(|key| params.get(*key).and_then(|v| v.as_str()));

        let updated = match (find, replace) {
            (Some(find), Some(replace)) => splice_replacement(&prior, find, replace).ok_or_else(|| {
                BridgeError::Execution(format!("could not find the target text in {path}"))
            })?,
            _ => {
                let instruction = require_str(params, "instruction")?;
                let messages = vec![
                    Message::system(EDIT_PROMPT),
                    Message::user(format!(
                        "File: {path}\n\nCurrent content:\n```\n{prior}\n```\n\nEdit instruction: {instruction}\n\nReturn the complete updated file content."
                    )),
                ];
                let response = ctx
                    .generator
                    .generate(&messages)
                    .await
                    .map_err(BridgeError::Execution)?;
                let updated = strip_code_fence(&response);
                if updated.trim().is_empty() {
                    return Err(BridgeError::Execution(
                        "model returned empty file content".to_string(),
                    ));
                }
                updated
            }
        };

        ctx.fs.write(path, &updated).await?;
        Ok(
            ActionOutcome::value(json!({ "path": path, "bytesWritten": updated.len() })).with_undo(
                UndoAction::RestoreFile {
                    path: path.to_string(),
                    prior,
                },
            ),
        )
    }
}

pub struct DeleteFileHandler;

#[async_trait]
impl ActionHandler for DeleteFileHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::DeleteFile
    }

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError> {
        let path = require_str(params, "path")?;
        let prior = ctx.fs.read(path).await?;
        ctx.fs.delete(path).await?;
        Ok(
            ActionOutcome::value(json!({ "path": path, "deleted": true })).with_undo(
                UndoAction::RestoreFile {
                    path: path.to_string(),
                    prior,
                },
            ),
        )
    }
}

pub struct CreateDirectoryHandler;

#[async_trait]
impl ActionHandler for CreateDirectoryHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::CreateDirectory
    }

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError> {
        let path = require_str(params, "path")?;
        // 已存在不算副作用，也就没有撤销
        if ctx.fs.exists(path).await {
            return Ok(ActionOutcome::value(json!({ "path": path, "created": false })));
        }
        ctx.fs.create_dir(path).await?;
        Ok(
            ActionOutcome::value(json!({ "path": path, "created": true })).with_undo(
                UndoAction::RemoveDir {
                    path: path.to_string(),
                },
            ),
        )
    }
}

pub struct RunCommandHandler;

#[async_trait]
impl ActionHandler for RunCommandHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::RunCommand
    }

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError> {
        let command = first_str(params, &["command", "cmd"])
            .ok_or_else(|| BridgeError::Validation("missing required param: command".to_string()))?;
        let out = ctx.shell.run(command).await?;
        if out.exit_code != 0 {
            return Err(BridgeError::Execution(format!(
                "command exited with {}: {}",
                out.exit_code,
                tail(&out.stderr, 500)
            )));
        }
        Ok(ActionOutcome::value(json!({
            "stdout": out.stdout,
            "stderr": out.stderr,
            "exitCode": out.exit_code,
        })))
    }
}

pub struct SearchCodebaseHandler;

#[async_trait]
impl ActionHandler for SearchCodebaseHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::SearchCodebase
    }

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError> {
        let query = require_str(params, "query")?.to_string();
        let file_pattern = first_str(params, &["filePattern", "file_pattern", "glob"]).map(String::from);
        let max_results = params
            .get("maxResults")
            .and_then(|v| v.as_u64())
            .unwrap_or(50)
            .min(200) as usize;
        let root = ctx.fs.root().to_path_buf();

        let needle = query.clone();
        let matches = tokio::task::spawn_blocking(move || {
            search_blocking(&root, &needle, file_pattern.as_deref(), max_results)
        })
        .await
        .map_err(|e| BridgeError::Execution(format!("search task failed: {e}")))??;

        Ok(ActionOutcome::value(json!({
            "query": query,
            "count": matches.len(),
            "matches": matches,
        })))
    }
}

fn search_blocking(
    root: &Path,
    query: &str,
    file_pattern: Option<&str>,
    max_results: usize,
) -> Result<Vec<Value>, BridgeError> {
    let include = match file_pattern {
        Some(p) => Some(
            glob::Pattern::new(p)
                .map_err(|e| BridgeError::Validation(format!("invalid file pattern: {e}")))?,
        ),
        None => None,
    };

    let mut matches = Vec::new();
    for entry in walkdir::WalkDir::new(root)
        .max_depth(10)
        .into_iter()
        .filter_entry(|e| {
            // 根目录放行，其余跳过隐藏目录与构建产物
            if e.depth() == 0 {
                return true;
            }
            let name = e.file_name().to_string_lossy();
            !name.starts_with('.') && name != "target" && name != "node_modules"
        })
        .filter_map(|e| e.ok())
    {
        if matches.len() >= max_results {
            break;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if let Some(pattern) = &include {
            let name_hit = pattern.matches(&entry.file_name().to_string_lossy());
            let rel_hit = pattern.matches(&rel.to_string_lossy());
            if !name_hit && !rel_hit {
                continue;
            }
        }
        let Ok(metadata) = entry.metadata() else { continue };
        if metadata.len() > 1024 * 1024 {
            continue;
        }
        // 二进制或不可读文件直接跳过
        let Ok(content) = std::fs::read_to_string(entry.path()) else { continue };
        for (line_no, line) in content.lines().enumerate() {
            if line.contains(query) {
                matches.push(json!({
                    "file": rel.to_string_lossy(),
                    "line": line_no + 1,
                    "text": line.trim(),
                }));
                if matches.len() >= max_results {
                    break;
                }
            }
        }
    }
    Ok(matches)
}

pub struct AnalyzeCodeHandler;

#[async_trait]
impl ActionHandler for AnalyzeCodeHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::AnalyzeCode
    }

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError> {
        let code = match optional_str(params, "path") {
            Some(path) => ctx.fs.read(path).await?,
            None => first_str(params, &["code", "content"])
                .ok_or_else(|| {
                    BridgeError::Validation("analyze_code needs a path or inline code".to_string())
                })?
                .to_string(),
        };
        let focus = optional_str(params, "instruction")
            .unwrap_or("structure, correctness risks and improvement opportunities");

        let messages = vec![
            Message::system(ANALYZE_PROMPT),
            Message::user(format!("Focus: {focus}\n\n```\n{code}\n```")),
        ];
        let analysis = ctx
            .generator
            .generate(&messages)
            .await
            .map_err(BridgeError::Execution)?;
        Ok(ActionOutcome::value(json!({ "analysis": analysis })))
    }
}

pub struct RefactorCodeHandler;

#[async_trait]
impl ActionHandler for RefactorCodeHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::RefactorCode
    }

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError> {
        let path = require_str(params, "path")?;
        let instruction = require_str(params, "instruction")?;
        let prior = ctx.fs.read(path).await?;

        let messages = vec![
            Message::system(REFACTOR_PROMPT),
            Message::user(format!(
                "File: {path}\n\n```\n{prior}\n```\n\nRefactor request: {instruction}\n\nReturn the complete refactored file content."
            )),
        ];
        let response = ctx
            .generator
            .generate(&messages)
            .await
            .map_err(BridgeError::Execution)?;
        let updated = strip_code_fence(&response);
        if updated.trim().is_empty() {
            return Err(BridgeError::Execution(
                "model returned empty file content".to_string(),
            ));
        }

        ctx.fs.write(path, &updated).await?;
        Ok(
            ActionOutcome::value(json!({ "path": path, "bytesWritten": updated.len() })).with_undo(
                UndoAction::RestoreFile {
                    path: path.to_string(),
                    prior,
                },
            ),
        )
    }
}

pub struct GenerateCodeHandler;

#[async_trait]
impl ActionHandler for GenerateCodeHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::GenerateCode
    }

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError> {
        let instruction = first_str(params, &["instruction", "prompt", "description"])
            .ok_or_else(|| BridgeError::Validation("missing required param: instruction".to_string()))?;

        let messages = vec![
            Message::system(GENERATE_PROMPT),
            Message::user(instruction.to_string()),
        ];
        let response = ctx
            .generator
            .generate(&messages)
            .await
            .map_err(BridgeError::Execution)?;
        let code = strip_code_fence(&response);

        // 给了路径就落盘，否则只回传代码文本
        if let Some(path) = optional_str(params, "path") {
            let prior = if ctx.fs.exists(path).await {
                Some(ctx.fs.read(path).await?)
            } else {
                None
            };
            ctx.fs.write(path, &code).await?;
            let undo = match prior {
                Some(prior) => UndoAction::RestoreFile {
                    path: path.to_string(),
                    prior,
                },
                None => UndoAction::RemoveFile {
                    path: path.to_string(),
                },
            };
            return Ok(
                ActionOutcome::value(json!({ "path": path, "code": code })).with_undo(undo),
            );
        }
        Ok(ActionOutcome::value(json!({ "code": code })))
    }
}

pub struct RunTestsHandler;

#[async_trait]
impl ActionHandler for RunTestsHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::RunTests
    }

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError> {
        let command = optional_str(params, "command").unwrap_or("cargo test");
        let out = ctx.shell.run(command).await?;
        if out.exit_code != 0 {
            let detail = format!("{}\n{}", out.stdout, out.stderr);
            return Err(BridgeError::Execution(format!(
                "tests failed (exit {}): {}",
                out.exit_code,
                tail(&detail, 500)
            )));
        }
        Ok(ActionOutcome::value(json!({ "passed": true, "stdout": out.stdout })))
    }
}

pub struct GitCommitHandler;

#[async_trait]
impl ActionHandler for GitCommitHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::GitCommit
    }

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError> {
        let message = require_str(params, "message")?;
        let workdir = ctx.shell.workdir().to_path_buf();

        let mut add_cmd = Command::new("git");
        add_cmd.arg("add");
        add_cmd.current_dir(&workdir);
        match params.get("files").and_then(|v| v.as_array()) {
            Some(files) => {
                for file in files {
                    if let Some(file) = file.as_str() {
                        add_cmd.arg(file);
                    }
                }
            }
            None => {
                add_cmd.arg("-A");
            }
        }
        let add_output = add_cmd
            .output()
            .await
            .map_err(|e| BridgeError::Execution(format!("failed to run git add: {e}")))?;
        if !add_output.status.success() {
            return Err(BridgeError::Execution(format!(
                "git add failed: {}",
                String::from_utf8_lossy(&add_output.stderr)
            )));
        }

        let commit_output = Command::new("git")
            .args(["commit", "-m", message])
            .current_dir(&workdir)
            .output()
            .await
            .map_err(|e| BridgeError::Execution(format!("failed to run git commit: {e}")))?;
        if !commit_output.status.success() {
            return Err(BridgeError::Execution(format!(
                "git commit failed: {}",
                String::from_utf8_lossy(&commit_output.stderr)
            )));
        }

        Ok(ActionOutcome::value(json!({
            "committed": true,
            "message": message,
            "output": String::from_utf8_lossy(&commit_output.stdout),
        })))
    }
}

pub struct CustomHandler;

#[async_trait]
impl ActionHandler for CustomHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Custom
    }

    async fn execute(&self, params: &Value, ctx: &ActionContext) -> Result<ActionOutcome, BridgeError> {
        let instruction = first_str(params, &["instruction", "prompt"])
            .ok_or_else(|| BridgeError::Validation("missing required param: instruction".to_string()))?;
        let messages = vec![
            Message::system(CUSTOM_PROMPT),
            Message::user(instruction.to_string()),
        ];
        let output = ctx
            .generator
            .generate(&messages)
            .await
            .map_err(BridgeError::Execution)?;
        Ok(ActionOutcome::text(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockGenerator;
    use tempfile::tempdir;

    fn test_ctx(root: &Path, generator: MockGenerator) -> ActionContext {
        ActionContext::new(
            SafeFs::new(root),
            ShellRunner::new(
                vec!["echo".into(), "ls".into(), "cat".into(), "true".into(), "false".into()],
                5,
                root,
            ),
            Arc::new(generator),
        )
    }

    #[tokio::test]
    async fn test_write_new_file_undo_removes_it() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path(), MockGenerator::new());

        let outcome = WriteFileHandler
            .execute(&json!({"path": "notes.txt", "content": "hello"}), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome.output["bytesWritten"], 5);
        assert!(matches!(outcome.undo, Some(UndoAction::RemoveFile { .. })));
        assert_eq!(ctx.fs.read("notes.txt").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_overwrite_keeps_prior_for_restore() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path(), MockGenerator::new());
        ctx.fs.write("notes.txt", "v1").await.unwrap();

        let outcome = WriteFileHandler
            .execute(&json!({"path": "notes.txt", "content": "v2"}), &ctx)
            .await
            .unwrap();

        match outcome.undo {
            Some(UndoAction::RestoreFile { prior, .. }) => assert_eq!(prior, "v1"),
            other => panic!("unexpected undo: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_edit_find_replace_with_indentation_tolerance() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path(), MockGenerator::new());
        ctx.fs
            .write("main.rs", "fn main() {\n    println!(\"Hello\");\n}\n")
            .await
            .unwrap();

        // find 不带缩进也要能命中
        let outcome = EditFileHandler
            .execute(
                &json!({"path": "main.rs", "find": "println!(\"Hello\");", "replace": "println!(\"World\");"}),
                &ctx,
            )
            .await
            .unwrap();

        assert!(matches!(outcome.undo, Some(UndoAction::RestoreFile { .. })));
        let content = ctx.fs.read("main.rs").await.unwrap();
        assert!(content.contains("println!(\"World\")"));
        assert!(!content.contains("Hello"));
    }

    #[tokio::test]
    async fn test_edit_fallback_preserves_crlf_line_endings() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path(), MockGenerator::new());
        ctx.fs
            .write("win.txt", "  left\r\n  right\r\nTAIL")
            .await
            .unwrap();

        // find 是 \n 规整过的两行，落到 CRLF 文件上也必须整行替换
        EditFileHandler
            .execute(
                &json!({"path": "win.txt", "find": "left\nright", "replace": "merged"}),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(ctx.fs.read("win.txt").await.unwrap(), "merged\r\nTAIL");
    }

    #[tokio::test]
    async fn test_edit_fallback_handles_crlf_with_multibyte_text() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path(), MockGenerator::new());
        ctx.fs.write("notes.txt", "  x\r\n注释\r\n").await.unwrap();

        EditFileHandler
            .execute(
                &json!({"path": "notes.txt", "find": "x\n注释", "replace": "done"}),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(ctx.fs.read("notes.txt").await.unwrap(), "done\r\n");
    }

    #[tokio::test]
    async fn test_edit_missing_target_is_execution_error() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path(), MockGenerator::new());
        ctx.fs.write("main.rs", "fn main() {}\n").await.unwrap();

        let err = EditFileHandler
            .execute(
                &json!({"path": "main.rs", "find": "does_not_exist", "replace": "x"}),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Execution(_)));
    }

    #[tokio::test]
    async fn test_delete_keeps_content_for_restore() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path(), MockGenerator::new());
        ctx.fs.write("gone.txt", "bye").await.unwrap();

        let outcome = DeleteFileHandler
            .execute(&json!({"path": "gone.txt"}), &ctx)
            .await
            .unwrap();

        assert!(!ctx.fs.exists("gone.txt").await);
        match outcome.undo {
            Some(UndoAction::RestoreFile { prior, .. }) => assert_eq!(prior, "bye"),
            other => panic!("unexpected undo: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_create_existing_directory_has_no_undo() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path(), MockGenerator::new());

        let first = CreateDirectoryHandler
            .execute(&json!({"path": "sub"}), &ctx)
            .await
            .unwrap();
        assert!(matches!(first.undo, Some(UndoAction::RemoveDir { .. })));

        let second = CreateDirectoryHandler
            .execute(&json!({"path": "sub"}), &ctx)
            .await
            .unwrap();
        assert_eq!(second.output["created"], false);
        assert!(second.undo.is_none());
    }

    #[tokio::test]
    async fn test_nonzero_command_exit_is_execution_error() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path(), MockGenerator::new());

        let err = RunCommandHandler
            .execute(&json!({"command": "ls /definitely_missing_axon_path"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Execution(_)));
    }

    #[tokio::test]
    async fn test_search_respects_file_pattern() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path(), MockGenerator::new());
        ctx.fs.write("a.rs", "fn alpha() {}\nfn beta() {}\n").await.unwrap();
        ctx.fs.write("b.txt", "alpha in text\n").await.unwrap();

        let outcome = SearchCodebaseHandler
            .execute(&json!({"query": "alpha", "filePattern": "*.rs"}), &ctx)
            .await
            .unwrap();

        assert_eq!(outcome.output["count"], 1);
        assert_eq!(outcome.output["matches"][0]["file"], "a.rs");
        assert_eq!(outcome.output["matches"][0]["line"], 1);
    }

    #[tokio::test]
    async fn test_custom_uses_generator_output() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(dir.path(), MockGenerator::with_responses(vec!["all done"]));

        let outcome = CustomHandler
            .execute(&json!({"instruction": "summarize"}), &ctx)
            .await
            .unwrap();
        assert_eq!(outcome.output["output"], "all done");
    }

    #[tokio::test]
    async fn test_generate_writes_file_when_path_given() {
        let dir = tempdir().unwrap();
        let ctx = test_ctx(
            dir.path(),
            MockGenerator::with_responses(vec!["```rust\nfn gen() {}\n```"]),
        );

        let outcome = GenerateCodeHandler
            .execute(&json!({"instruction": "make gen", "path": "gen.rs"}), &ctx)
            .await
            .unwrap();

        assert!(matches!(outcome.undo, Some(UndoAction::RemoveFile { .. })));
        assert_eq!(ctx.fs.read("gen.rs").await.unwrap(), "fn gen() {}");
    }

    #[test]
    fn test_standard_registry_covers_every_action() {
        assert!(ActionRegistry::standard().validate_complete().is_ok());

        let empty = ActionRegistry::new();
        let err = empty.validate_complete().unwrap_err();
        assert!(err.to_string().contains("missing action handlers"));
    }

    #[test]
    fn test_strip_code_fence_variants() {
        assert_eq!(strip_code_fence("```rust\nfn a() {}\n```"), "fn a() {}");
        assert_eq!(strip_code_fence("```\nplain\n```"), "plain");
        assert_eq!(strip_code_fence("no fence"), "no fence");
        assert_eq!(strip_code_fence("```json\n{\"a\":1}"), "{\"a\":1}");
    }
}
