//! Scripting runtime: engine setup and the native bridge objects.
//!
//! Three objects are pushed into a page's scope before any script runs:
//!   phantom  - session introspection, page creation, exit
//!   fs       - filesystem bridge
//!   console  - console relay with call-site annotation
//!
//! The bridges stay thin. The bundled bootstrap script layers the
//! friendlier helpers (`fs.open`, `fs.read`, `fs.write`, `fs.size`) on top.

use std::borrow::Cow;
use std::cell::RefCell;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Weak;

use rhai::{
    Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map, NativeCallContext, ParseError,
    Position, Scope, AST,
};
use thiserror::Error;

use crate::console::ConsoleRelay;
use crate::fs::{File, FileSystem};
use crate::page::{PageId, WebPage};
use crate::phantom::Session;

pub const PHANTOM_OBJECT: &str = "phantom";
pub const FS_OBJECT: &str = "fs";
pub const CONSOLE_OBJECT: &str = "console";

type RhaiResult<T> = Result<T, Box<EvalAltResult>>;

/// Why a script file could not be run.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Can't open '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Runtime(#[from] Box<EvalAltResult>),
}

// ═══════════════════════════════════════════════════════════════════════════════
// BRIDGE OBJECTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Script-side `phantom` object.
#[derive(Clone)]
pub struct PhantomBridge {
    session: Weak<RefCell<Session>>,
}

/// Script-side handle to a page created with `phantom.createWebPage()`.
#[derive(Clone)]
pub struct PageHandle {
    id: PageId,
    session: Weak<RefCell<Session>>,
}

/// Script-side `console` object.
#[derive(Clone)]
pub struct ConsoleBridge {
    relay: ConsoleRelay,
}

impl ConsoleBridge {
    fn log(&self, ctx: &NativeCallContext, message: &Dynamic) {
        let line = ctx.call_position().line().unwrap_or(0);
        self.relay
            .message(&message.to_string(), line, ctx.call_source().unwrap_or(""));
    }
}

fn with_session<R>(
    session: &Weak<RefCell<Session>>,
    f: impl FnOnce(&mut Session) -> R,
) -> RhaiResult<R> {
    let cell = session
        .upgrade()
        .ok_or_else(|| Box::<EvalAltResult>::from("phantom session has ended"))?;
    let mut session = cell
        .try_borrow_mut()
        .map_err(|_| Box::<EvalAltResult>::from("phantom session is busy"))?;
    Ok(f(&mut session))
}

/// Script integers are 64-bit; out-of-range exit codes saturate.
fn exit_code(code: i64) -> i32 {
    i32::try_from(code).unwrap_or(if code < 0 { i32::MIN } else { i32::MAX })
}

fn terminated(code: i32) -> Box<EvalAltResult> {
    EvalAltResult::ErrorTerminated(Dynamic::from(code as i64), Position::NONE).into()
}

/// Push the bridge objects into `scope`.
pub(crate) fn install_bridges(
    scope: &mut Scope<'static>,
    session: Weak<RefCell<Session>>,
    relay: ConsoleRelay,
) {
    scope.push(PHANTOM_OBJECT, PhantomBridge { session });
    scope.push(FS_OBJECT, FileSystem::new());
    scope.push(CONSOLE_OBJECT, ConsoleBridge { relay });
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCRIPT EVALUATION
// ═══════════════════════════════════════════════════════════════════════════════

/// `path` as given when it exists or is absolute, otherwise relative to
/// `library_path`.
pub fn resolve_script(path: &Path, library_path: &Path) -> PathBuf {
    if path.is_absolute() || path.exists() {
        path.to_path_buf()
    } else {
        library_path.join(path)
    }
}

/// Comment out a leading `#!` line, keeping line numbers intact.
fn strip_shebang(source: &str) -> Cow<'_, str> {
    match source.strip_prefix("#!") {
        Some(rest) => Cow::Owned(format!("//{rest}")),
        None => Cow::Borrowed(source),
    }
}

/// Read, compile and run a script file in `scope`, with the bootstrap
/// functions available.
pub fn run_file(
    engine: &Engine,
    scope: &mut Scope,
    bootstrap: Option<&AST>,
    path: &Path,
) -> Result<(), ScriptError> {
    let source = std::fs::read_to_string(path).map_err(|source| ScriptError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let script = engine.compile(strip_shebang(&source).as_ref())?;
    let mut ast = match bootstrap {
        Some(functions) => functions.merge(&script),
        None => script,
    };
    ast.set_source(path.display().to_string());
    log::debug!("Running {} ({} bytes)", path.display(), source.len());
    engine.run_ast_with_scope(scope, &ast)?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Engine with every bridge type registered and output routed to `relay`.
pub fn build_engine(relay: &ConsoleRelay) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_call_levels(64);

    let print_relay = relay.clone();
    engine.on_print(move |text| print_relay.message(text, 0, ""));
    let debug_relay = relay.clone();
    engine.on_debug(move |text, source, pos| {
        debug_relay.message(text, pos.line().unwrap_or(0), source.unwrap_or(""))
    });

    register_phantom(&mut engine);
    register_pages(&mut engine);
    register_fs(&mut engine);
    register_console(&mut engine);
    engine
}

fn register_phantom(engine: &mut Engine) {
    engine
        .register_type_with_name::<PhantomBridge>("Phantom")
        .register_get("args", |p: &mut PhantomBridge| -> RhaiResult<Array> {
            with_session(&p.session, |s| {
                s.script_args().iter().cloned().map(Dynamic::from).collect()
            })
        })
        .register_get("scriptName", |p: &mut PhantomBridge| -> RhaiResult<String> {
            with_session(&p.session, |s| s.script_name())
        })
        .register_get("version", |_: &mut PhantomBridge| -> Map {
            let (major, minor, patch) = crate::version();
            let mut map = Map::new();
            map.insert("major".into(), Dynamic::from(major));
            map.insert("minor".into(), Dynamic::from(minor));
            map.insert("patch".into(), Dynamic::from(patch));
            map
        })
        .register_get("defaultPageSettings", |p: &mut PhantomBridge| -> RhaiResult<Map> {
            with_session(&p.session, |s| s.default_settings().to_map())
        })
        .register_get_set(
            "libraryPath",
            |p: &mut PhantomBridge| -> RhaiResult<String> {
                with_session(&p.session, |s| s.library_path().display().to_string())
            },
            |p: &mut PhantomBridge, path: String| -> RhaiResult<()> {
                with_session(&p.session, |s| s.set_library_path(PathBuf::from(path)))
            },
        )
        .register_fn("createWebPage", |p: &mut PhantomBridge| -> RhaiResult<PageHandle> {
            let id = with_session(&p.session, |s| s.create_page())?
                .ok_or_else(|| Box::<EvalAltResult>::from("phantom has exited"))?;
            Ok(PageHandle {
                id,
                session: p.session.clone(),
            })
        })
        .register_fn("_destroy", |p: &mut PhantomBridge, page: PageHandle| -> RhaiResult<bool> {
            with_session(&p.session, |s| s.destroy_page(page.id))
        })
        .register_fn("exit", |p: &mut PhantomBridge| -> RhaiResult<()> {
            with_session(&p.session, |s| s.exit(0))?;
            Err(terminated(0))
        })
        .register_fn("exit", |p: &mut PhantomBridge, code: i64| -> RhaiResult<()> {
            let code = exit_code(code);
            with_session(&p.session, |s| s.exit(code))?;
            Err(terminated(code))
        })
        .register_fn("getStdinLine", |p: &mut PhantomBridge| -> RhaiResult<String> {
            with_session(&p.session, |s| s.read_stdin_line())
        })
        .register_fn(
            "injectJs",
            |ctx: NativeCallContext, p: &mut PhantomBridge, path: ImmutableString| -> RhaiResult<bool> {
                let (file, bootstrap, relay) = with_session(&p.session, |s| {
                    (
                        resolve_script(Path::new(path.as_str()), s.library_path()),
                        s.bootstrap().cloned(),
                        s.relay().clone(),
                    )
                })?;

                let mut scope = Scope::new();
                install_bridges(&mut scope, p.session.clone(), relay);
                match run_file(ctx.engine(), &mut scope, bootstrap.as_ref(), &file) {
                    Ok(()) => Ok(true),
                    Err(ScriptError::Runtime(err))
                        if with_session(&p.session, |s| s.is_terminated())? =>
                    {
                        Err(err)
                    }
                    Err(err) => {
                        log::warn!("injectJs: {}", err);
                        Ok(false)
                    }
                }
            },
        );
}

fn page_scope(page: &PageHandle) -> RhaiResult<std::rc::Rc<RefCell<Scope<'static>>>> {
    with_session(&page.session, |s| s.page(page.id).map(WebPage::scope))?
        .ok_or_else(|| Box::<EvalAltResult>::from("page has been destroyed"))
}

fn register_pages(engine: &mut Engine) {
    engine
        .register_type_with_name::<PageHandle>("WebPage")
        .register_get("id", |page: &mut PageHandle| page.id as i64)
        .register_get_set(
            "settings",
            |page: &mut PageHandle| -> RhaiResult<Map> {
                with_session(&page.session, |s| s.page(page.id).map(|p| p.settings().to_map()))?
                    .ok_or_else(|| "page has been destroyed".into())
            },
            |page: &mut PageHandle, map: Map| -> RhaiResult<()> {
                with_session(&page.session, |s| {
                    if let Some(p) = s.page_mut(page.id) {
                        let mut settings = p.settings().clone();
                        settings.merge_map(&map);
                        p.apply_settings(&settings);
                    }
                })
            },
        )
        .register_get_set(
            "libraryPath",
            |page: &mut PageHandle| -> RhaiResult<String> {
                with_session(&page.session, |s| {
                    s.page(page.id)
                        .map(|p| p.library_path().display().to_string())
                        .unwrap_or_default()
                })
            },
            |page: &mut PageHandle, path: String| -> RhaiResult<()> {
                with_session(&page.session, |s| {
                    if let Some(p) = s.page_mut(page.id) {
                        p.set_library_path(path);
                    }
                })
            },
        )
        .register_fn(
            "evaluate",
            |ctx: NativeCallContext, page: &mut PageHandle, code: ImmutableString| -> RhaiResult<Dynamic> {
                let scope = page_scope(page)?;
                let mut scope = scope
                    .try_borrow_mut()
                    .map_err(|_| Box::<EvalAltResult>::from("page is already running a script"))?;
                ctx.engine().eval_with_scope::<Dynamic>(&mut scope, code.as_str())
            },
        )
        .register_get("networkPolicy", |page: &mut PageHandle| -> RhaiResult<Map> {
            with_session(&page.session, |s| s.page(page.id).map(|p| p.network_policy().to_map()))?
                .ok_or_else(|| "page has been destroyed".into())
        })
        .register_fn("release", |page: &mut PageHandle| -> RhaiResult<bool> {
            with_session(&page.session, |s| s.destroy_page(page.id))
        });
}

fn register_fs(engine: &mut Engine) {
    engine
        .register_type_with_name::<FileSystem>("FileSystem")
        .register_get("separator", |fs: &mut FileSystem| fs.separator())
        .register_get("workingDirectory", |fs: &mut FileSystem| fs.working_directory())
        .register_fn("changeWorkingDirectory", |fs: &mut FileSystem, path: ImmutableString| {
            fs.change_working_directory(path.as_str())
        })
        .register_fn("absolute", |fs: &mut FileSystem, path: ImmutableString| {
            fs.absolute(path.as_str())
        })
        .register_fn("_size", |fs: &mut FileSystem, path: ImmutableString| {
            fs.size(path.as_str())
        })
        .register_fn("lastModified", |fs: &mut FileSystem, path: ImmutableString| -> Dynamic {
            fs.last_modified(path.as_str())
                .map(Dynamic::from)
                .unwrap_or(Dynamic::UNIT)
        })
        .register_fn("_open", |fs: &mut FileSystem, path: ImmutableString, mode: ImmutableString| -> Dynamic {
            fs.open(path.as_str(), mode.as_str())
                .map(Dynamic::from)
                .unwrap_or(Dynamic::UNIT)
        })
        .register_fn("makeDirectory", |fs: &mut FileSystem, path: ImmutableString| {
            fs.make_directory(path.as_str())
        })
        .register_fn("makeTree", |fs: &mut FileSystem, path: ImmutableString| {
            fs.make_tree(path.as_str())
        })
        .register_fn("removeDirectory", |fs: &mut FileSystem, path: ImmutableString| {
            fs.remove_directory(path.as_str())
        })
        .register_fn("removeTree", |fs: &mut FileSystem, path: ImmutableString| {
            fs.remove_tree(path.as_str())
        })
        .register_fn("remove", |fs: &mut FileSystem, path: ImmutableString| {
            fs.remove(path.as_str())
        })
        .register_fn("list", |fs: &mut FileSystem, path: ImmutableString| -> Array {
            fs.list(path.as_str()).into_iter().map(Dynamic::from).collect()
        })
        .register_fn("exists", |fs: &mut FileSystem, path: ImmutableString| {
            fs.exists(path.as_str())
        })
        .register_fn("isDirectory", |fs: &mut FileSystem, path: ImmutableString| {
            fs.is_directory(path.as_str())
        })
        .register_fn("isFile", |fs: &mut FileSystem, path: ImmutableString| {
            fs.is_file(path.as_str())
        });

    engine
        .register_type_with_name::<File>("File")
        .register_fn("read", |file: &mut File| file.read())
        .register_fn("readLine", |file: &mut File| file.read_line())
        .register_fn("write", |file: &mut File, data: ImmutableString| {
            file.write(data.as_str())
        })
        .register_fn("writeLine", |file: &mut File, data: ImmutableString| {
            file.write_line(data.as_str())
        })
        .register_fn("atEnd", |file: &mut File| file.at_end())
        .register_fn("flush", |file: &mut File| file.flush())
        .register_fn("close", |file: &mut File| file.close());
}

fn register_console(engine: &mut Engine) {
    engine
        .register_type_with_name::<ConsoleBridge>("Console")
        .register_fn("log", |ctx: NativeCallContext, console: &mut ConsoleBridge, message: Dynamic| {
            console.log(&ctx, &message)
        })
        .register_fn("error", |ctx: NativeCallContext, console: &mut ConsoleBridge, message: Dynamic| {
            console.log(&ctx, &message)
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::SharedBuffer;
    use tempfile::TempDir;

    #[test]
    fn shebang_line_is_commented_out() {
        assert_eq!(strip_shebang("#!/usr/bin/env phantom\nprint(1);"), "///usr/bin/env phantom\nprint(1);");
        assert_eq!(strip_shebang("print(1);"), "print(1);");
    }

    #[test]
    fn exit_codes_saturate() {
        assert_eq!(exit_code(3), 3);
        assert_eq!(exit_code(-1), -1);
        assert_eq!(exit_code(4_294_967_299), i32::MAX);
        assert_eq!(exit_code(-4_294_967_299), i32::MIN);
    }

    #[test]
    fn resolve_prefers_existing_path() {
        let dir = TempDir::new().unwrap();
        let lib = dir.path();
        assert_eq!(resolve_script(Path::new("missing.rhai"), lib), lib.join("missing.rhai"));
        let absolute = lib.join("x.rhai");
        assert_eq!(resolve_script(&absolute, Path::new("/elsewhere")), absolute);
    }

    #[test]
    fn print_and_debug_go_through_relay() {
        let buffer = SharedBuffer::new();
        let engine = build_engine(&ConsoleRelay::with_writer(buffer.clone()));
        engine.run(r#"print("plain");"#).unwrap();
        assert_eq!(buffer.lines(), vec!["plain"]);
    }

    #[test]
    fn fs_bridge_is_scriptable() {
        let dir = TempDir::new().unwrap();
        let buffer = SharedBuffer::new();
        let engine = build_engine(&ConsoleRelay::with_writer(buffer.clone()));
        let mut scope = Scope::new();
        scope.push(FS_OBJECT, FileSystem::new());
        scope.push("dir", dir.path().display().to_string());

        let listed: Array = engine
            .eval_with_scope(
                &mut scope,
                r#"
                    let path = dir + fs.separator + "note.txt";
                    let f = fs._open(path, "w");
                    f.writeLine("hello");
                    f.close();
                    if !fs.isFile(path) { throw "not written"; }
                    if fs._size(path) != 6 { throw "wrong size"; }
                    if type_of(fs._open(dir + "/missing", "r")) != "()" { throw "opened missing"; }
                    fs.list(dir)
                "#,
            )
            .unwrap();
        let names: Vec<String> = listed.into_iter().map(|d| d.into_string().unwrap()).collect();
        assert_eq!(names, vec![".", "..", "note.txt"]);
    }
}
