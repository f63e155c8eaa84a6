//! Linking of independently uploaded widget functions
//!
//! Functions arrive one at a time as (name, parameters, body) templates.
//! On the first call the set is composed: every template is compiled and
//! wrapped so that each function can call its siblings by bare name, plus
//! any registered host dependencies. Composition seals the set; later
//! uploads are rejected.
//!
//! Sibling and dependency values are appended as trailing parameters of the
//! compiled function. A sibling whose name is shadowed by one of the
//! function's own parameters is skipped, and the wrapper injects links by
//! index so the remaining siblings still line up with their parameters.

use std::collections::{HashMap, HashSet};

use rquickjs::function::Args;
use rquickjs::{Array, CatchResultExt, Ctx, Function, Persistent, Value};

use crate::SandboxError;

const WRAP_FACTORY: &str = r#"
(function (raw, links, indices, deps) {
  return function () {
    var args = Array.prototype.slice.call(arguments);
    for (var i = 0; i < indices.length; i++) args.push(links[indices[i]]);
    for (var j = 0; j < deps.length; j++) args.push(deps[j]);
    return raw.apply(this, args);
  };
})
"#;

const ASYNC_WRAP_FACTORY: &str = r#"
(function (raw, links, indices, deps) {
  return async function () {
    var args = Array.prototype.slice.call(arguments);
    for (var i = 0; i < indices.length; i++) args.push(links[indices[i]]);
    for (var j = 0; j < deps.length; j++) args.push(deps[j]);
    return raw.apply(this, args);
  };
})
"#;

struct FunctionTemplate {
    is_async: bool,
    name: String,
    parameters: Vec<String>,
    body: String,
}

struct WrappedFunction {
    callable: Persistent<Function<'static>>,
    is_async: bool,
}

/// Set of widget functions, mutable until composed
#[derive(Default)]
pub struct FunctionLinkSet {
    templates: Vec<FunctionTemplate>,
    dependencies: Vec<(String, Persistent<Value<'static>>)>,
    wrapped: HashMap<String, WrappedFunction>,
    sealed: bool,
}

impl FunctionLinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a function template. Uploading a name twice keeps the later
    /// body; the function keeps its original position in link order.
    pub fn add(
        &mut self,
        is_async: bool,
        name: impl Into<String>,
        parameters: Vec<String>,
        body: impl Into<String>,
    ) -> Result<(), SandboxError> {
        if self.sealed {
            return Err(SandboxError::AlreadySealed);
        }
        self.templates.push(FunctionTemplate {
            is_async,
            name: name.into(),
            parameters,
            body: body.into(),
        });
        Ok(())
    }

    /// Register a host value every function receives as a trailing parameter
    pub fn add_dependency(
        &mut self,
        name: impl Into<String>,
        value: Persistent<Value<'static>>,
    ) -> Result<(), SandboxError> {
        if self.sealed {
            return Err(SandboxError::AlreadySealed);
        }
        self.dependencies.push((name.into(), value));
        Ok(())
    }

    pub fn sealed(&self) -> bool {
        self.sealed
    }

    /// Compile and wrap every staged template, sealing the set
    pub fn compose(&mut self, ctx: &Ctx<'_>) -> Result<(), SandboxError> {
        if self.sealed {
            return Err(SandboxError::AlreadySealed);
        }

        let mut ordered: Vec<FunctionTemplate> = Vec::new();
        for template in self.templates.drain(..) {
            match ordered.iter_mut().find(|t| t.name == template.name) {
                Some(slot) => *slot = template,
                None => ordered.push(template),
            }
        }
        let sibling_names: Vec<String> = ordered.iter().map(|t| t.name.clone()).collect();

        let links = Array::new(ctx.clone())
            .catch(ctx)
            .map_err(|e| SandboxError::Js(e.to_string()))?;
        let deps = Array::new(ctx.clone())
            .catch(ctx)
            .map_err(|e| SandboxError::Js(e.to_string()))?;
        for (i, (_, value)) in self.dependencies.iter().enumerate() {
            let restored = value
                .clone()
                .restore(ctx)
                .catch(ctx)
                .map_err(|e| SandboxError::Js(e.to_string()))?;
            deps.set(i, restored)
                .catch(ctx)
                .map_err(|e| SandboxError::Js(e.to_string()))?;
        }

        let factory: Function = ctx
            .eval(WRAP_FACTORY)
            .catch(ctx)
            .map_err(|e| SandboxError::Init(e.to_string()))?;
        let async_factory: Function = ctx
            .eval(ASYNC_WRAP_FACTORY)
            .catch(ctx)
            .map_err(|e| SandboxError::Init(e.to_string()))?;

        for (index, template) in ordered.iter().enumerate() {
            let own: HashSet<&str> = template.parameters.iter().map(String::as_str).collect();
            let injected: Vec<(usize, &str)> = sibling_names
                .iter()
                .enumerate()
                .filter(|(_, name)| !own.contains(name.as_str()))
                .map(|(i, name)| (i, name.as_str()))
                .collect();

            let mut parameters: Vec<&str> =
                template.parameters.iter().map(String::as_str).collect();
            parameters.extend(injected.iter().map(|(_, name)| *name));
            parameters.extend(self.dependencies.iter().map(|(name, _)| name.as_str()));

            let head = if template.is_async {
                "async function"
            } else {
                "function"
            };
            let source = format!(
                "({head} ({params}) {{\n{body}\n}})",
                params = parameters.join(", "),
                body = template.body,
            );
            let raw: Function = ctx
                .eval(source)
                .catch(ctx)
                .map_err(|e| SandboxError::Js(format!("compiling '{}': {e}", template.name)))?;

            let indices = Array::new(ctx.clone())
                .catch(ctx)
                .map_err(|e| SandboxError::Js(e.to_string()))?;
            for (slot, (link_index, _)) in injected.iter().enumerate() {
                indices
                    .set(slot, *link_index as u32)
                    .catch(ctx)
                    .map_err(|e| SandboxError::Js(e.to_string()))?;
            }

            let chosen = if template.is_async {
                &async_factory
            } else {
                &factory
            };
            let wrapper: Function = chosen
                .call((raw, links.clone(), indices, deps.clone()))
                .catch(ctx)
                .map_err(|e| SandboxError::Js(e.to_string()))?;
            links
                .set(index, wrapper.clone())
                .catch(ctx)
                .map_err(|e| SandboxError::Js(e.to_string()))?;

            self.wrapped.insert(
                template.name.clone(),
                WrappedFunction {
                    callable: Persistent::save(ctx, wrapper),
                    is_async: template.is_async,
                },
            );
        }

        self.sealed = true;
        Ok(())
    }

    /// Invoke a composed function. The result may be a pending promise;
    /// pass it through [`settle`] to drive it to completion.
    pub fn call<'js>(
        &self,
        ctx: &Ctx<'js>,
        name: &str,
        values: Vec<Value<'js>>,
    ) -> Result<Value<'js>, SandboxError> {
        let Some(wrapped) = self.wrapped.get(name) else {
            return Err(SandboxError::UnknownFunction(name.to_string()));
        };
        let callable = wrapped
            .callable
            .clone()
            .restore(ctx)
            .catch(ctx)
            .map_err(|e| SandboxError::Js(e.to_string()))?;
        let mut args = Args::new(ctx.clone(), values.len());
        for value in values {
            args.push_arg(value)
                .catch(ctx)
                .map_err(|e| SandboxError::Js(e.to_string()))?;
        }
        callable
            .call_arg(args)
            .catch(ctx)
            .map_err(|e| SandboxError::Js(e.to_string()))
    }

    pub fn is_async(&self, name: &str) -> Result<bool, SandboxError> {
        self.wrapped
            .get(name)
            .map(|w| w.is_async)
            .ok_or_else(|| SandboxError::UnknownFunction(name.to_string()))
    }
}

/// Drive a promise to completion, running queued jobs as needed. Plain
/// values pass through untouched.
pub fn settle<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> Result<Value<'js>, SandboxError> {
    if let Some(promise) = value.as_promise() {
        return promise
            .finish::<Value>()
            .catch(ctx)
            .map_err(|e| SandboxError::Js(e.to_string()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    fn with_ctx<R>(f: impl FnOnce(&Ctx<'_>) -> R) -> R {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| f(&ctx))
    }

    fn call_number(
        links: &FunctionLinkSet,
        ctx: &Ctx<'_>,
        name: &str,
        arg: i32,
    ) -> Result<f64, SandboxError> {
        let value = Value::new_int(ctx.clone(), arg);
        let result = links.call(ctx, name, vec![value])?;
        let result = settle(ctx, result)?;
        Ok(result.get::<f64>().unwrap())
    }

    #[test]
    fn siblings_call_each_other_by_name() {
        with_ctx(|ctx| {
            let mut links = FunctionLinkSet::new();
            links
                .add(false, "inner", vec!["x".into()], "return x + 1;")
                .unwrap();
            links
                .add(false, "outer", vec!["x".into()], "return inner(x) * 2;")
                .unwrap();
            links.compose(ctx).unwrap();
            assert_eq!(call_number(&links, ctx, "outer", 5).unwrap(), 12.0);
        });
    }

    #[test]
    fn mutual_recursion_links_both_ways() {
        with_ctx(|ctx| {
            let mut links = FunctionLinkSet::new();
            links
                .add(
                    false,
                    "isEven",
                    vec!["n".into()],
                    "return n === 0 ? 1 : isOdd(n - 1);",
                )
                .unwrap();
            links
                .add(
                    false,
                    "isOdd",
                    vec!["n".into()],
                    "return n === 0 ? 0 : isEven(n - 1);",
                )
                .unwrap();
            links.compose(ctx).unwrap();
            assert_eq!(call_number(&links, ctx, "isEven", 10).unwrap(), 1.0);
            assert_eq!(call_number(&links, ctx, "isEven", 7).unwrap(), 0.0);
        });
    }

    #[test]
    fn shadowed_sibling_name_is_the_parameter() {
        with_ctx(|ctx| {
            let mut links = FunctionLinkSet::new();
            links
                .add(false, "helper", vec![], "return 100;")
                .unwrap();
            // Parameter "helper" shadows the sibling of the same name, and
            // "other" must still resolve to the real sibling behind it.
            links
                .add(false, "other", vec![], "return 7;")
                .unwrap();
            links
                .add(
                    false,
                    "taker",
                    vec!["helper".into()],
                    "return helper + other();",
                )
                .unwrap();
            links.compose(ctx).unwrap();
            assert_eq!(call_number(&links, ctx, "taker", 1).unwrap(), 8.0);
        });
    }

    #[test]
    fn duplicate_upload_keeps_the_later_body() {
        with_ctx(|ctx| {
            let mut links = FunctionLinkSet::new();
            links.add(false, "f", vec![], "return 1;").unwrap();
            links.add(false, "f", vec![], "return 2;").unwrap();
            links.compose(ctx).unwrap();
            assert_eq!(call_number(&links, ctx, "f", 0).unwrap(), 2.0);
        });
    }

    #[test]
    fn dependencies_are_injected() {
        with_ctx(|ctx| {
            let mut links = FunctionLinkSet::new();
            let seven: Value = ctx.eval("7").unwrap();
            links
                .add_dependency("seven", Persistent::save(ctx, seven))
                .unwrap();
            links
                .add(false, "plus", vec!["x".into()], "return x + seven;")
                .unwrap();
            links.compose(ctx).unwrap();
            assert_eq!(call_number(&links, ctx, "plus", 3).unwrap(), 10.0);
        });
    }

    #[test]
    fn composition_seals_the_set() {
        with_ctx(|ctx| {
            let mut links = FunctionLinkSet::new();
            links.add(false, "f", vec![], "return 1;").unwrap();
            links.compose(ctx).unwrap();
            assert!(matches!(
                links.add(false, "g", vec![], "return 2;"),
                Err(SandboxError::AlreadySealed)
            ));
            assert!(matches!(
                links.compose(ctx),
                Err(SandboxError::AlreadySealed)
            ));
        });
    }

    #[test]
    fn unknown_function_is_reported() {
        with_ctx(|ctx| {
            let mut links = FunctionLinkSet::new();
            links.compose(ctx).unwrap();
            match links.call(ctx, "missing", Vec::new()) {
                Err(SandboxError::UnknownFunction(name)) => assert_eq!(name, "missing"),
                other => panic!("unexpected: {other:?}"),
            }
        });
    }

    #[test]
    fn async_functions_settle_to_values() {
        with_ctx(|ctx| {
            let mut links = FunctionLinkSet::new();
            links
                .add(
                    true,
                    "later",
                    vec!["x".into()],
                    "return await Promise.resolve(x * 2);",
                )
                .unwrap();
            links.compose(ctx).unwrap();
            assert!(links.is_async("later").unwrap());
            assert_eq!(call_number(&links, ctx, "later", 21).unwrap(), 42.0);
        });
    }

    #[test]
    fn thrown_errors_surface_their_message() {
        with_ctx(|ctx| {
            let mut links = FunctionLinkSet::new();
            links
                .add(false, "boom", vec![], "throw new Error('bad widget');")
                .unwrap();
            links.compose(ctx).unwrap();
            match links.call(ctx, "boom", Vec::new()) {
                Err(SandboxError::Js(message)) => assert!(message.contains("bad widget")),
                other => panic!("unexpected: {other:?}"),
            }
        });
    }

    #[test]
    fn syntax_errors_fail_composition() {
        with_ctx(|ctx| {
            let mut links = FunctionLinkSet::new();
            links.add(false, "broken", vec![], "return ((;").unwrap();
            match links.compose(ctx) {
                Err(SandboxError::Js(message)) => assert!(message.contains("broken")),
                other => panic!("unexpected: {other:?}"),
            }
        });
    }
}
