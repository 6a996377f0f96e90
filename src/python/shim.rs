//! Guest-facing stand-ins: a `psycopg2` DB-API module over [`DatabaseDriver`],
//! a virtual `os`, a scratch `open()` and the import hook serving them.
//!
//! The Python half lives in [`SHIM_SOURCE`] and is evaluated in its own scope
//! for every execution. It reaches the host only through two native
//! functions injected into that scope.

use parking_lot::Mutex;
use rustpython_vm::{
    builtins::PyDictRef, compiler::Mode, function::FuncArgs, PyObjectRef, PyResult, VirtualMachine,
};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::driver::{
    check_credentials, coerce_date, date_parts, expected_credentials, rewrite_placeholders,
    DatabaseDriver,
};
use crate::error::{Result, SandboxError};
use crate::types::{QueryOutcome, SqlValue};

/// Host-access modules nothing may import while guest code runs. The
/// filesystem ones would hand out the real `open` and file types.
pub(crate) const BLOCKED_MODULES: &[&str] = &[
    "socket", "_socket", "ssl", "_ssl", "select", "selectors", "subprocess",
    "_posixsubprocess", "multiprocessing", "ctypes", "_ctypes", "posix", "nt", "pty",
    "signal", "shutil", "urllib", "http", "ftplib", "smtplib", "asyncio",
    "builtins", "io", "_io", "pathlib", "importlib", "_imp",
];

/// Modules the import hook answers itself.
const SERVED_MODULES: &[&str] = &["psycopg2", "os", "os.path"];

pub(crate) const SHIM_SOURCE: &str = r#"
class Error(Exception):
    pass


class Warning(Exception):
    pass


class InterfaceError(Error):
    pass


class DatabaseError(Error):
    pass


class OperationalError(DatabaseError):
    pass


class ProgrammingError(DatabaseError):
    pass


def _quote(text):
    out = ['"']
    for ch in text:
        code = ord(ch)
        if ch == '"':
            out.append('\\"')
        elif ch == '\\':
            out.append('\\\\')
        elif code < 0x20:
            out.append('\\u%04x' % code)
        else:
            out.append(ch)
    out.append('"')
    return ''.join(out)


def _encode(value):
    if value is None:
        return 'null'
    if value is True:
        return 'true'
    if value is False:
        return 'false'
    if isinstance(value, int):
        return str(value)
    if isinstance(value, float):
        if value != value or value in (float('inf'), float('-inf')):
            raise ProgrammingError("can't adapt non-finite float")
        return repr(value)
    if isinstance(value, str):
        return _quote(value)
    if isinstance(value, (list, tuple)):
        return '[' + ','.join([_encode(v) for v in value]) + ']'
    if isinstance(value, dict):
        return '{' + ','.join([_quote(str(k)) + ':' + _encode(v) for k, v in value.items()]) + '}'
    if hasattr(value, 'isoformat'):
        return _quote(value.isoformat())
    raise ProgrammingError("can't adapt type '%s'" % type(value).__name__)


_date_type = []


def _make_date(year, month, day):
    if not _date_type:
        try:
            import datetime
            _date_type.append(datetime.date)
        except Exception:
            _date_type.append(None)
    if _date_type[0] is None:
        return '%04d-%02d-%02d' % (year, month, day)
    return _date_type[0](year, month, day)


class Cursor:
    arraysize = 1

    def __init__(self, connection):
        self.connection = connection
        self.description = None
        self.rowcount = -1
        self.closed = False
        self._rows = []
        self._index = 0

    def _check(self):
        if self.closed:
            raise InterfaceError('cursor already closed')
        if self.connection.closed:
            raise InterfaceError('connection already closed')

    def execute(self, query, params=None):
        self._check()
        encoded = None
        if params:
            if isinstance(params, dict):
                raise ProgrammingError('named parameters are not supported')
            encoded = _encode(list(params))
        result = _native_execute(query, encoded, _make_date)
        if 'error' in result:
            if result['kind'] == 'operational':
                raise OperationalError(result['error'])
            raise DatabaseError(result['error'])
        names = result['names']
        if names:
            self.description = [
                (name, type_id, None, None, None, None, None)
                for name, type_id in zip(names, result['type_ids'])
            ]
        else:
            self.description = None
        self._rows = result['rows']
        self._index = 0
        self.rowcount = result['rowcount']

    def executemany(self, query, seq_of_params):
        total = 0
        for params in seq_of_params:
            self.execute(query, params)
            total += max(self.rowcount, 0)
        self.rowcount = total

    def fetchone(self):
        self._check()
        if self._index < len(self._rows):
            row = self._rows[self._index]
            self._index += 1
            return row
        return None

    def fetchmany(self, size=None):
        self._check()
        if size is None:
            size = self.arraysize
        rows = self._rows[self._index:self._index + size]
        self._index += len(rows)
        return rows

    def fetchall(self):
        self._check()
        rows = self._rows[self._index:]
        self._index = len(self._rows)
        return rows

    def __iter__(self):
        while True:
            row = self.fetchone()
            if row is None:
                return
            yield row

    def close(self):
        self.closed = True

    def __enter__(self):
        return self

    def __exit__(self, exc_type, exc, tb):
        self.close()
        return False


class Connection:
    def __init__(self):
        self.closed = False
        self.autocommit = False

    def cursor(self):
        if self.closed:
            raise InterfaceError('connection already closed')
        return Cursor(self)

    def commit(self):
        pass

    def rollback(self):
        pass

    def close(self):
        self.closed = True

    def __enter__(self):
        return self

    def __exit__(self, exc_type, exc, tb):
        return False


def connect(dsn=None, **kwargs):
    args = {}
    for key, value in kwargs.items():
        args[key] = str(value)
    failure = _native_connect(dsn, _encode(args))
    if failure is not None:
        raise OperationalError(failure)
    return Connection()


class _VirtualModule:
    def __init__(self, name, attrs):
        self.__name__ = name
        for key, value in attrs.items():
            setattr(self, key, value)

    def __repr__(self):
        return "<module '%s' (sandbox)>" % self.__name__


psycopg2 = _VirtualModule('psycopg2', {
    'connect': connect,
    'Error': Error,
    'Warning': Warning,
    'InterfaceError': InterfaceError,
    'DatabaseError': DatabaseError,
    'OperationalError': OperationalError,
    'ProgrammingError': ProgrammingError,
    'apilevel': '2.0',
    'threadsafety': 1,
    'paramstyle': 'format',
})


def _normalize(path):
    path = str(path)
    while path.startswith('./'):
        path = path[2:]
    return path


class _ScratchFile:
    def __init__(self, name, mode):
        self.name = name
        self.mode = mode
        self.closed = False
        self._pos = 0
        if 'r' in mode:
            if name not in _files:
                raise FileNotFoundError("[Errno 2] No such file or directory: '%s'" % name)
        elif 'w' in mode:
            _files[name] = ''
        elif 'a' in mode:
            _files.setdefault(name, '')
        else:
            raise ValueError("invalid mode: '%s'" % mode)

    def _check(self):
        if self.closed:
            raise ValueError('I/O operation on closed file.')

    def read(self, size=-1):
        self._check()
        data = _files[self.name]
        if size is None or size < 0:
            chunk = data[self._pos:]
        else:
            chunk = data[self._pos:self._pos + size]
        self._pos += len(chunk)
        return chunk

    def readline(self):
        self._check()
        data = _files[self.name]
        end = data.find('\n', self._pos)
        end = len(data) if end < 0 else end + 1
        line = data[self._pos:end]
        self._pos = end
        return line

    def readlines(self):
        return list(self)

    def __iter__(self):
        while True:
            line = self.readline()
            if not line:
                return
            yield line

    def write(self, text):
        self._check()
        if 'r' in self.mode and '+' not in self.mode:
            raise OSError('File not open for writing')
        _files[self.name] = _files[self.name] + text
        return len(text)

    def close(self):
        self.closed = True

    def __enter__(self):
        return self

    def __exit__(self, exc_type, exc, tb):
        self.close()
        return False


def scratch_open(file, mode='r', *args, **kwargs):
    if 'b' in mode:
        raise ValueError('binary mode is not supported in the sandbox')
    return _ScratchFile(_normalize(file), mode)


def _getenv(key, default=None):
    return _env.get(key, default)


def _listdir(path='.'):
    if _normalize(path) not in ('.', ''):
        raise FileNotFoundError("[Errno 2] No such file or directory: '%s'" % path)
    return sorted(_files.keys())


def _exists(path):
    return _normalize(path) in _files or _normalize(path) in ('.', '')


def _join(first, *rest):
    out = str(first)
    for part in rest:
        part = str(part)
        if part.startswith('/'):
            out = part
        elif not out or out.endswith('/'):
            out = out + part
        else:
            out = out + '/' + part
    return out


os_path = _VirtualModule('os.path', {
    'exists': _exists,
    'isfile': lambda path: _normalize(path) in _files,
    'join': _join,
    'basename': lambda path: str(path).rsplit('/', 1)[-1],
})

os_module = _VirtualModule('os', {
    'environ': _env,
    'getenv': _getenv,
    'listdir': _listdir,
    'path': os_path,
    'sep': '/',
    'linesep': '\n',
    'name': 'posix',
})

def guest_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level == 0 and globals is not None and globals.get('__name__') == '__main__':
        if name == 'psycopg2':
            return psycopg2
        if name == 'os':
            return os_module
        if name == 'os.path':
            return os_path if fromlist else os_module
        top = name.split('.')[0]
        if top in _blocked or top in ('os', 'psycopg2'):
            raise ImportError("module '%s' is not available in the sandbox" % name)
    return _original_import(name, globals, locals, fromlist, level)
"#;

/// Handles produced by evaluating the shim for one execution.
pub(crate) struct Shim {
    pub import_hook: PyObjectRef,
    pub open: PyObjectRef,
}

/// Evaluate the shim in a fresh scope wired to `driver`.
pub(crate) fn load(
    vm: &VirtualMachine,
    driver: Arc<dyn DatabaseDriver>,
    original_import: PyObjectRef,
    env: &BTreeMap<String, String>,
    files: &BTreeMap<String, String>,
) -> PyResult<Shim> {
    let scope = vm.new_scope_with_builtins();
    let globals = &scope.globals;
    globals.set_item("__name__", vm.ctx.new_str("psycopg2").into(), vm)?;
    globals.set_item("_original_import", original_import, vm)?;
    globals.set_item("_env", string_dict(vm, env)?.into(), vm)?;
    globals.set_item("_files", string_dict(vm, files)?.into(), vm)?;
    let blocked: Vec<PyObjectRef> = BLOCKED_MODULES
        .iter()
        .map(|name| vm.ctx.new_str(*name).into())
        .collect();
    globals.set_item("_blocked", vm.ctx.new_tuple(blocked).into(), vm)?;
    globals.set_item("_native_execute", native_execute(vm, driver), vm)?;
    globals.set_item("_native_connect", native_connect(vm, env), vm)?;

    let code = vm
        .compile(SHIM_SOURCE, Mode::Exec, "<psycopg2>".to_owned())
        .map_err(|e| vm.new_runtime_error(format!("driver shim failed to compile: {}", e)))?;
    vm.run_code_obj(code, scope.clone())?;

    Ok(Shim {
        import_hook: globals.get_item("guest_import", vm)?,
        open: globals.get_item("scratch_open", vm)?,
    })
}

fn string_dict(vm: &VirtualMachine, map: &BTreeMap<String, String>) -> PyResult<PyDictRef> {
    let dict = vm.ctx.new_dict();
    for (key, value) in map {
        dict.set_item(key.as_str(), vm.ctx.new_str(value.as_str()).into(), vm)?;
    }
    Ok(dict)
}

fn optional_string(args: &FuncArgs, index: usize, vm: &VirtualMachine) -> PyResult<Option<String>> {
    match args.args.get(index) {
        None => Ok(None),
        Some(obj) if vm.is_none(obj) => Ok(None),
        Some(obj) => Ok(Some(obj.str(vm)?.as_str().to_owned())),
    }
}

/// `_native_execute(query, params_json, make_date)` returns either
/// `{names, type_ids, rows, rowcount}` or `{error, kind}`.
fn native_execute(vm: &VirtualMachine, driver: Arc<dyn DatabaseDriver>) -> PyObjectRef {
    vm.new_function(
        "_native_execute",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let sql = optional_string(&args, 0, vm)?.unwrap_or_default();
            let params = optional_string(&args, 1, vm)?;
            let make_date = args.args.get(2).cloned();

            match run_query(driver.as_ref(), &sql, params.as_deref()) {
                Ok(outcome) => outcome_to_py(vm, outcome, make_date.as_ref()),
                Err(err) => error_to_py(vm, &err),
            }
        },
    )
    .into()
}

fn run_query(driver: &dyn DatabaseDriver, sql: &str, params_json: Option<&str>) -> Result<QueryOutcome> {
    let params = match params_json {
        Some(json) => {
            let values: Vec<serde_json::Value> =
                serde_json::from_str(json).map_err(|e| SandboxError::Query {
                    message: format!("malformed query parameters: {}", e),
                })?;
            values
                .iter()
                .map(SqlValue::from_json)
                .collect::<Result<Vec<_>>>()?
        }
        None => Vec::new(),
    };
    let sql = rewrite_placeholders(sql, params_json.is_some());
    driver.execute(&sql, &params)
}

fn outcome_to_py(
    vm: &VirtualMachine,
    outcome: QueryOutcome,
    make_date: Option<&PyObjectRef>,
) -> PyResult<PyObjectRef> {
    let names: Vec<PyObjectRef> = outcome
        .fields
        .iter()
        .map(|f| vm.ctx.new_str(f.name.as_str()).into())
        .collect();
    let type_ids: Vec<PyObjectRef> = outcome
        .fields
        .iter()
        .map(|f| vm.ctx.new_int(f.type_id).into())
        .collect();

    let mut rows: Vec<PyObjectRef> = Vec::with_capacity(outcome.rows.len());
    for row in outcome.rows {
        let mut values: Vec<PyObjectRef> = Vec::with_capacity(row.len());
        for (value, field) in row.into_iter().zip(&outcome.fields) {
            values.push(value_to_py(vm, value, field.type_id, make_date)?);
        }
        rows.push(vm.ctx.new_tuple(values).into());
    }

    let dict = vm.ctx.new_dict();
    dict.set_item("names", vm.ctx.new_list(names).into(), vm)?;
    dict.set_item("type_ids", vm.ctx.new_list(type_ids).into(), vm)?;
    dict.set_item("rows", vm.ctx.new_list(rows).into(), vm)?;
    dict.set_item("rowcount", vm.ctx.new_int(outcome.row_count).into(), vm)?;
    Ok(dict.into())
}

fn value_to_py(
    vm: &VirtualMachine,
    value: SqlValue,
    type_id: u32,
    make_date: Option<&PyObjectRef>,
) -> PyResult<PyObjectRef> {
    if let (Some(date), Some(make_date)) = (coerce_date(type_id, &value), make_date) {
        let (year, month, day) = date_parts(date);
        let args: (PyObjectRef, PyObjectRef, PyObjectRef) = (
            vm.ctx.new_int(year).into(),
            vm.ctx.new_int(month).into(),
            vm.ctx.new_int(day).into(),
        );
        return make_date.call(args, vm);
    }
    Ok(match value {
        SqlValue::Null => vm.ctx.none(),
        SqlValue::Integer(i) => vm.ctx.new_int(i).into(),
        SqlValue::Real(f) => vm.ctx.new_float(f).into(),
        SqlValue::Text(s) => vm.ctx.new_str(s).into(),
        SqlValue::Blob(bytes) => vm.ctx.new_bytes(bytes).into(),
    })
}

fn error_to_py(vm: &VirtualMachine, err: &SandboxError) -> PyResult<PyObjectRef> {
    let kind = match err {
        SandboxError::Query { .. } | SandboxError::DumpLoad { .. } => "database",
        _ => "operational",
    };
    let dict = vm.ctx.new_dict();
    dict.set_item("error", vm.ctx.new_str(err.to_string()).into(), vm)?;
    dict.set_item("kind", vm.ctx.new_str(kind).into(), vm)?;
    Ok(dict.into())
}

/// `_native_connect(dsn, kwargs_json)` returns `None` or the mismatch message.
fn native_connect(vm: &VirtualMachine, env: &BTreeMap<String, String>) -> PyObjectRef {
    let expected = expected_credentials(env);
    vm.new_function(
        "_native_connect",
        move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
            let dsn = optional_string(&args, 0, vm)?;
            let kwargs_json = optional_string(&args, 1, vm)?.unwrap_or_else(|| "{}".to_string());
            let kwargs: BTreeMap<String, String> = serde_json::from_str(&kwargs_json)
                .map_err(|e| vm.new_runtime_error(format!("malformed connect arguments: {}", e)))?;

            match check_credentials(&expected, dsn.as_deref(), &kwargs) {
                Ok(()) => Ok(vm.ctx.none()),
                Err(err) => Ok(vm.ctx.new_str(err.to_string()).into()),
            }
        },
    )
    .into()
}

/// Shared sink for guest `sys.stdout` and `sys.stderr`.
#[derive(Clone, Default)]
pub(crate) struct CapturedOutput(Arc<Mutex<String>>);

impl CapturedOutput {
    pub fn snapshot(&self) -> String {
        self.0.lock().clone()
    }

    fn writer(&self, vm: &VirtualMachine) -> PyObjectRef {
        let sink = self.clone();
        let write = vm.new_function(
            "write",
            move |args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> {
                let text = optional_string(&args, 0, vm)?.unwrap_or_default();
                let written = text.chars().count();
                sink.0.lock().push_str(&text);
                Ok(vm.ctx.new_int(written).into())
            },
        );
        let flush = vm.new_function(
            "flush",
            move |_args: FuncArgs, vm: &VirtualMachine| -> PyResult<PyObjectRef> { Ok(vm.ctx.none()) },
        );

        let ns = vm.new_module("<capture>", vm.ctx.new_dict(), None);
        let _ = ns.set_attr("write", write, vm);
        let _ = ns.set_attr("flush", flush, vm);
        let _ = ns.set_attr("closed", vm.ctx.new_bool(false), vm);
        let _ = ns.set_attr("encoding", vm.ctx.new_str("utf-8"), vm);
        ns.into()
    }
}

/// Swaps interpreter-wide hooks in for one execution and puts the previous
/// ones back when dropped, whichever way the execution ends.
pub(crate) struct ExecutionGuard<'vm> {
    vm: &'vm VirtualMachine,
    stdout: Option<PyObjectRef>,
    stderr: Option<PyObjectRef>,
    import: Option<PyObjectRef>,
    open: Option<PyObjectRef>,
    /// Previous `sys.modules` entries; `None` when the name was absent.
    hidden_modules: Vec<(&'static str, Option<PyObjectRef>)>,
}

impl<'vm> ExecutionGuard<'vm> {
    /// Route `sys.stdout` and `sys.stderr` into `output`.
    pub fn capture(vm: &'vm VirtualMachine, output: &CapturedOutput) -> Self {
        let guard = Self {
            vm,
            stdout: vm.sys_module.get_attr("stdout", vm).ok(),
            stderr: vm.sys_module.get_attr("stderr", vm).ok(),
            import: None,
            open: None,
            hidden_modules: Vec::new(),
        };
        let writer = output.writer(vm);
        let _ = vm.sys_module.set_attr("stdout", writer.clone(), vm);
        let _ = vm.sys_module.set_attr("stderr", writer, vm);
        guard
    }

    /// Current `builtins.__import__`, the one the hook delegates to.
    pub fn current_import(&self) -> PyResult<PyObjectRef> {
        self.vm.builtins.get_attr("__import__", self.vm)
    }

    /// Install the guest import hook.
    ///
    /// A plain `import` of a cached module never reaches `__import__`, so
    /// cached entries for the served names are hidden meanwhile, and every
    /// blocked name is pinned to `None`, which fails any import of it.
    pub fn install_import_hook(&mut self, hook: PyObjectRef) -> PyResult<()> {
        let vm = self.vm;
        let original = self.current_import()?;
        vm.builtins.set_attr("__import__", hook, vm)?;
        self.import = Some(original);

        let modules = vm.sys_module.get_attr("modules", vm)?;
        for name in SERVED_MODULES.iter().chain(BLOCKED_MODULES) {
            let cached = vm.call_method(&modules, "pop", (vm.ctx.new_str(*name), vm.ctx.none()))?;
            let previous = if vm.is_none(&cached) { None } else { Some(cached) };
            self.hidden_modules.push((*name, previous));
        }
        for name in BLOCKED_MODULES {
            vm.call_method(&modules, "__setitem__", (vm.ctx.new_str(*name), vm.ctx.none()))?;
        }
        Ok(())
    }

    /// Replace `builtins.open`, which `__builtins__.open` resolves to as well.
    pub fn install_open(&mut self, open: PyObjectRef) -> PyResult<()> {
        let vm = self.vm;
        let original = vm.builtins.get_attr("open", vm)?;
        vm.builtins.set_attr("open", open, vm)?;
        self.open = Some(original);
        Ok(())
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        let vm = self.vm;
        if let Some(open) = self.open.take() {
            let _ = vm.builtins.set_attr("open", open, vm);
        }
        if let Some(import) = self.import.take() {
            let _ = vm.builtins.set_attr("__import__", import, vm);
        }
        if let Ok(modules) = vm.sys_module.get_attr("modules", vm) {
            for (name, previous) in self.hidden_modules.drain(..) {
                let key = vm.ctx.new_str(name);
                let _ = match previous {
                    Some(module) => vm.call_method(&modules, "__setitem__", (key, module)),
                    None => vm.call_method(&modules, "pop", (key, vm.ctx.none())),
                };
            }
        }
        if let Some(stdout) = self.stdout.take() {
            let _ = vm.sys_module.set_attr("stdout", stdout, vm);
        }
        if let Some(stderr) = self.stderr.take() {
            let _ = vm.sys_module.set_attr("stderr", stderr, vm);
        }
    }
}
