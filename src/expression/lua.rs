//! Sandboxed Lua evaluation for expressions and code nodes
//!
//! Every evaluation gets a fresh `mlua` state with the filesystem, process and
//! loader libraries removed and a hard memory cap. `$`-variables are rewritten
//! to `_`-prefixed globals before the chunk is loaded. Long-running chunks are
//! stopped by an instruction-count hook.

use mlua::{Function, HookTriggers, Lua, LuaSerdeExt, SerializeOptions, Table, VmState};
use serde_json::{json, Value};
use std::time::{Duration, Instant};

use super::{ExpressionError, ExpressionScope};
use crate::data::Item;

/// Globals removed from every sandbox
const BLOCKED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "debug",
    "package",
    "require",
    "load",
    "loadfile",
    "dofile",
    "collectgarbage",
];

/// Fresh Lua state with dangerous globals removed and memory capped
pub fn sandbox(memory_limit: usize) -> mlua::Result<Lua> {
    let lua = Lua::new();
    lua.set_memory_limit(memory_limit)?;

    let globals = lua.globals();
    for name in BLOCKED_GLOBALS {
        globals.set(*name, mlua::Nil)?;
    }

    // Safe time helpers in place of os.date / os.time
    globals.set(
        "date",
        lua.create_function(|_, format: String| Ok(chrono::Utc::now().format(&format).to_string()))?,
    )?;
    globals.set("time", lua.create_function(|_, ()| Ok(chrono::Utc::now().timestamp()))?)?;
    globals.set("now", lua.create_function(|_, ()| Ok(chrono::Utc::now().to_rfc3339()))?)?;

    Ok(lua)
}

/// Raised from the interrupt hook when a script has to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("script interrupted")]
pub struct Interrupted;

/// VM instructions between interrupt checks
const HOOK_INTERVAL: u32 = 1_000;

/// Abort the running chunk as soon as `stop` returns true
pub fn interrupt_when(lua: &Lua, stop: impl Fn() -> bool + Send + 'static) -> mlua::Result<()> {
    lua.set_global_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_, _| {
            if stop() {
                Err(mlua::Error::external(Interrupted))
            } else {
                Ok(VmState::Continue)
            }
        },
    )
}

pub fn is_interrupted(error: &mlua::Error) -> bool {
    error.chain().any(|cause| cause.is::<Interrupted>())
}

fn serialize_options() -> SerializeOptions {
    SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false)
}

/// Convert JSON into a Lua value; JSON null becomes nil
pub fn to_lua(lua: &Lua, value: &Value) -> mlua::Result<mlua::Value> {
    lua.to_value_with(value, serialize_options())
}

/// Convert a Lua value to JSON
///
/// Tables with keys `1..n` become arrays, anything else becomes an object.
/// Functions, userdata and threads become null.
pub fn lua_to_json(lua_value: mlua::Value) -> mlua::Result<Value> {
    match lua_value {
        mlua::Value::Nil => Ok(Value::Null),
        mlua::Value::Boolean(b) => Ok(Value::Bool(b)),
        mlua::Value::Integer(i) => Ok(Value::Number(serde_json::Number::from(i))),
        mlua::Value::Number(f) => Ok(serde_json::Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)),
        mlua::Value::String(s) => Ok(Value::String(s.to_str()?.to_string())),
        mlua::Value::Table(table) => {
            let mut is_array = true;
            let mut max_index = 0;
            let mut count = 0;

            for pair in table.pairs::<mlua::Value, mlua::Value>() {
                let (key, _) = pair?;
                count += 1;
                match key {
                    mlua::Value::Integer(i) if i > 0 => max_index = max_index.max(i as usize),
                    _ => {
                        is_array = false;
                        break;
                    }
                }
            }

            if is_array && count > 0 && count == max_index {
                let mut array = Vec::with_capacity(max_index);
                for i in 1..=max_index {
                    array.push(lua_to_json(table.get(i)?)?);
                }
                Ok(Value::Array(array))
            } else {
                let mut object = serde_json::Map::new();
                for pair in table.pairs::<mlua::Value, mlua::Value>() {
                    let (key, value) = pair?;
                    let key = match key {
                        mlua::Value::String(s) => s.to_str()?.to_string(),
                        mlua::Value::Integer(i) => i.to_string(),
                        mlua::Value::Number(f) => f.to_string(),
                        _ => continue,
                    };
                    object.insert(key, lua_to_json(value)?);
                }
                Ok(Value::Object(object))
            }
        }
        _ => Ok(Value::Null),
    }
}

/// Rewrite `$name` to `_name` and `$(` to `_node_ref(` outside string literals
pub(crate) fn rewrite(expr: &str) -> String {
    let mut out = String::with_capacity(expr.len() + 8);
    let mut chars = expr.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '"' | '\'' => {
                quote = Some(c);
                out.push(c);
            }
            '$' => match chars.peek() {
                Some('(') => out.push_str("_node_ref"),
                Some(next) if next.is_ascii_alphabetic() || *next == '_' => out.push('_'),
                _ => out.push(c),
            },
            _ => out.push(c),
        }
    }
    out
}

fn item_table(item: Option<&Item>) -> Value {
    match item {
        Some(item) => json!({"json": item.json, "binary": item.binary}),
        None => json!({"json": {}, "binary": {}}),
    }
}

fn value_fn(lua: &Lua, value: Value) -> mlua::Result<Function> {
    lua.create_function(move |lua, _: mlua::MultiValue| to_lua(lua, &value))
}

/// `{ item, json, binary, first(), last(), all() }` for a list of items
fn accessor_table(lua: &Lua, paired: Option<&Item>, items: &[Item]) -> mlua::Result<Table> {
    let paired = item_table(paired);
    let table = lua.create_table()?;
    table.set("item", to_lua(lua, &paired)?)?;
    table.set("json", to_lua(lua, &paired["json"])?)?;
    table.set("binary", to_lua(lua, &paired["binary"])?)?;
    table.set("first", value_fn(lua, item_table(items.first()))?)?;
    table.set("last", value_fn(lua, item_table(items.last()))?)?;
    table.set(
        "all",
        value_fn(lua, Value::Array(items.iter().map(|i| item_table(Some(i))).collect()))?,
    )?;
    Ok(table)
}

fn install_scope(lua: &Lua, scope: &ExpressionScope<'_>, referenced: &[String]) -> Result<(), ExpressionError> {
    let setup = || -> mlua::Result<()> {
        let globals = lua.globals();
        let current = item_table(scope.item);
        globals.set("_json", to_lua(lua, &current["json"])?)?;
        globals.set("_binary", to_lua(lua, &current["binary"])?)?;
        globals.set("_itemIndex", scope.item_index)?;
        globals.set("_runIndex", scope.run_index)?;

        let execution = scope.execution;
        let input: Vec<Value> = execution.input.iter().map(Item::json_value).collect();
        globals.set(
            "_execution",
            to_lua(lua, &json!({"id": execution.id, "mode": execution.mode, "input": input}))?,
        )?;
        globals.set(
            "_workflow",
            to_lua(lua, &json!({"id": execution.workflow_id, "name": execution.workflow_name}))?,
        )?;
        globals.set("_input", accessor_table(lua, scope.item, scope.inputs)?)?;
        Ok(())
    };
    setup().map_err(evaluation_error)?;

    let nodes = lua.create_table().map_err(evaluation_error)?;
    for name in referenced {
        let paired = scope.paired_item(name)?;
        let table = accessor_table(lua, paired, scope.node_items(name)).map_err(evaluation_error)?;
        nodes.set(name.as_str(), table).map_err(evaluation_error)?;
    }

    let finish = || -> mlua::Result<()> {
        let globals = lua.globals();
        globals.set("_node", nodes.clone())?;
        lua.load(
            r#"setmetatable(_node, { __index = function(_, name)
                error("node '" .. tostring(name) .. "' has not produced output", 2)
            end })"#,
        )
        .exec()?;
        let lookup = nodes.clone();
        globals.set(
            "_node_ref",
            lua.create_function(move |_, name: String| lookup.get::<mlua::Value>(name))?,
        )?;
        Ok(())
    };
    finish().map_err(evaluation_error)
}

fn evaluation_error(e: mlua::Error) -> ExpressionError {
    ExpressionError::Evaluation {
        expression: String::new(),
        message: e.to_string(),
    }
}

/// Evaluate one expression body (without `{{ }}`) in a fresh sandbox
pub(crate) fn evaluate(
    expr: &str,
    scope: &ExpressionScope<'_>,
    referenced: &[String],
    memory_limit: usize,
    time_limit: Duration,
) -> Result<Value, ExpressionError> {
    let lua = sandbox(memory_limit).map_err(evaluation_error)?;
    install_scope(&lua, scope, referenced).map_err(|e| e.with_expression(expr))?;

    let deadline = Instant::now() + time_limit;
    interrupt_when(&lua, move || Instant::now() >= deadline).map_err(evaluation_error)?;

    let chunk = format!("return {}", rewrite(expr));
    let result = lua
        .load(&chunk)
        .set_name("expression")
        .eval::<mlua::Value>()
        .map_err(|e| match e {
            mlua::Error::SyntaxError { message, .. } => ExpressionError::Syntax {
                expression: expr.to_string(),
                message,
            },
            ref interrupted if is_interrupted(interrupted) => ExpressionError::TimedOut {
                expression: expr.to_string(),
                limit: time_limit,
            },
            other => ExpressionError::Evaluation {
                expression: expr.to_string(),
                message: other.to_string(),
            },
        })?;

    lua_to_json(result).map_err(|e| evaluation_error(e).with_expression(expr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_skips_string_literals() {
        assert_eq!(rewrite("$json.a + 1"), "_json.a + 1");
        assert_eq!(rewrite(r#"$("Fetch").item.json.id"#), r#"_node_ref("Fetch").item.json.id"#);
        assert_eq!(rewrite("'$json' .. $itemIndex"), "'$json' .. _itemIndex");
        assert_eq!(rewrite(r#""a\"$b" .. $c"#), r#""a\"$b" .. _c"#);
    }

    #[test]
    fn sandbox_removes_dangerous_globals() {
        let lua = sandbox(1024 * 1024).unwrap();
        let os: mlua::Value = lua.globals().get("os").unwrap();
        assert!(os.is_nil());
        assert!(lua.load("return require('os')").eval::<mlua::Value>().is_err());
        let t: i64 = lua.load("return time()").eval().unwrap();
        assert!(t > 0);
    }

    #[test]
    fn memory_limit_is_enforced() {
        let lua = sandbox(256 * 1024).unwrap();
        let result = lua
            .load("local t = {} for i = 1, 10000000 do t[i] = string.rep('x', 64) .. i end return #t")
            .eval::<mlua::Value>();
        assert!(result.is_err());
    }

    #[test]
    fn interrupt_hook_stops_a_busy_loop() {
        let lua = sandbox(1024 * 1024).unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);
        interrupt_when(&lua, move || Instant::now() >= deadline).unwrap();

        let started = Instant::now();
        let err = lua.load("while true do end").exec().unwrap_err();
        assert!(is_interrupted(&err));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!is_interrupted(&mlua::Error::runtime("plain failure")));
    }

    #[test]
    fn lua_tables_convert_to_json() {
        let lua = Lua::new();
        let value: mlua::Value = lua.load("return {1, 2, {name = 'x', ok = true}}").eval().unwrap();
        assert_eq!(lua_to_json(value).unwrap(), json!([1, 2, {"name": "x", "ok": true}]));

        let value = to_lua(&lua, &json!({"a": [1, 2], "b": null})).unwrap();
        assert_eq!(lua_to_json(value).unwrap(), json!({"a": [1, 2]}));
    }
}
