//! Harness Generator: wraps a submission and its fixtures into one Python
//! program.
//!
//! The submission comes first, verbatim. The driver that follows runs after
//! untrusted code has had its chance to rebind names, so it trusts nothing at
//! module level: every helper is taken from the `builtins` module inside the
//! driver, fixtures arrive as hex-escaped bytes literals, fixture text is
//! parsed with `compile(..., PyCF_ONLY_AST)` and walked by the driver itself,
//! and the result line is written by a local JSON emitter straight to fd 1.
//! The `json`, `ast` and `base64` modules are never consulted, so patching
//! them from the submission changes nothing. Results are compared
//! structurally on exact types rather than through a user-overridable
//! `__eq__`.
//!
//! A `MemoryError` inside a fixture is re-raised so the run ends the way a
//! module-level breach does and is reported as a resource limit.

use crate::protocol::new_sentinel;
use codedrill_common::types::TestFixture;
use handlebars::Handlebars;
use serde::Serialize;
use thiserror::Error;

const HARNESS_TEMPLATE_NAME: &str = "python_harness";

const HARNESS_TEMPLATE: &str = r#"{{submission}}

# ---- codedrill driver ----
def __codedrill_main():
    import builtins as _b
    import sys as _sys

    _type, _len, _zip, _repr, _str = _b.type, _b.len, _b.zip, _b.repr, _b.str
    _int, _float, _bool, _bytes, _complex = _b.int, _b.float, _b.bool, _b.bytes, _b.complex
    _list, _tuple, _dict, _set, _frozenset = _b.list, _b.tuple, _b.dict, _b.set, _b.frozenset
    _getattr, _ord, _enumerate, _open, _compile = _b.getattr, _b.ord, _b.enumerate, _b.open, _b.compile
    _BaseException, _MemoryError = _b.BaseException, _b.MemoryError
    _NameError, _ValueError = _b.NameError, _b.ValueError
    _SCALARS = (_int, _float, _bool, _str, _bytes, _complex, _type(None), _type(...))

    namespace = _b.globals()
    safe_builtins = {
        "abs": _b.abs, "all": _b.all, "any": _b.any, "bool": _bool, "dict": _dict,
        "float": _float, "frozenset": _frozenset, "int": _int, "len": _len,
        "list": _list, "max": _b.max, "min": _b.min, "range": _b.range,
        "reversed": _b.reversed, "round": _b.round, "set": _set, "sorted": _b.sorted,
        "str": _str, "sum": _b.sum, "tuple": _tuple,
    }

    def parse(text):
        # 1024 is ast.PyCF_ONLY_AST
        return _compile(text, "<fixture>", "eval", 1024).body

    _Name = _type(parse("x"))
    _Attribute = _type(parse("x.y"))
    _Call = _type(parse("x()"))
    _Starred = _type(parse("x(*y)").args[0])
    _Constant = _type(parse("0"))
    _List = _type(parse("[]"))
    _Tuple = _type(parse("()"))
    _Set = _type(parse("{0}"))
    _Dict = _type(parse("{}"))
    _UnaryOp = _type(parse("-0"))
    _USub = _type(parse("-0").op)
    _UAdd = _type(parse("+0").op)

    def literal(node):
        kind = _type(node)
        if kind is _Constant:
            return node.value
        if kind is _List:
            return [literal(item) for item in node.elts]
        if kind is _Tuple:
            return _tuple([literal(item) for item in node.elts])
        if kind is _Set:
            return _set([literal(item) for item in node.elts])
        if kind is _Dict:
            result = {}
            for key, item in _zip(node.keys, node.values):
                if key is None:
                    raise _ValueError("dict unpacking is not supported in fixtures")
                result[literal(key)] = literal(item)
            return result
        if kind is _UnaryOp and (_type(node.op) is _USub or _type(node.op) is _UAdd):
            operand = literal(node.operand)
            number = _type(operand)
            if number is _int or number is _float or number is _complex:
                return -operand if _type(node.op) is _USub else operand
        if kind is _Call and _type(node.func) is _Name and node.func.id == "set":
            if not node.args and not node.keywords:
                return _set()
        raise _ValueError("malformed literal in fixture")

    def lookup(name):
        if not name.startswith("__") and name in namespace:
            return namespace[name]
        if name in safe_builtins:
            return safe_builtins[name]
        raise _NameError("name '%s' is not defined" % name)

    def value(node):
        kind = _type(node)
        if kind is _Name:
            return lookup(node.id)
        if kind is _Attribute:
            if node.attr.startswith("__"):
                raise _ValueError("attribute '%s' is not accessible" % node.attr)
            return _getattr(value(node.value), node.attr)
        if kind is _Call:
            target = value(node.func)
            args = []
            for arg in node.args:
                if _type(arg) is _Starred:
                    raise _ValueError("argument unpacking is not supported in fixtures")
                args.append(value(arg))
            kwargs = {}
            for kw in node.keywords:
                if kw.arg is None:
                    raise _ValueError("keyword unpacking is not supported in fixtures")
                kwargs[kw.arg] = value(kw.value)
            return target(*args, **kwargs)
        return literal(node)

    def plain(obj):
        kind = _type(obj)
        if kind is _tuple or kind is _frozenset:
            for item in obj:
                if not plain(item):
                    return False
            return True
        for scalar in _SCALARS:
            if kind is scalar:
                return True
        return False

    def same(actual, expected):
        ta, te = _type(actual), _type(expected)
        if te is _list or te is _tuple:
            if ta is not te or _len(actual) != _len(expected):
                return False
            for a, e in _zip(actual, expected):
                if not same(a, e):
                    return False
            return True
        if te is _dict:
            if ta is not _dict or _len(actual) != _len(expected):
                return False
            for key in actual:
                if not plain(key) or key not in expected:
                    return False
            for key in expected:
                if not same(actual[key], expected[key]):
                    return False
            return True
        if te is _set or te is _frozenset:
            if ta is not _set and ta is not _frozenset:
                return False
            for item in actual:
                if not plain(item):
                    return False
            return actual == expected
        if (te is _int or te is _float) and (ta is _int or ta is _float):
            return actual == expected
        return ta is te and actual == expected

    def show(obj):
        try:
            text = _str.__str__(_repr(obj))
        except _MemoryError:
            raise
        except _BaseException as exc:
            text = "<unrepresentable %s>" % _type(exc).__name__
        return text if _len(text) <= {{max_repr}} else text[:{{max_repr}}] + "..."

    def describe(exc):
        try:
            detail = _str(exc)
        except _MemoryError:
            raise
        except _BaseException:
            detail = "<unprintable>"
        return "%s: %s" % (_type(exc).__name__, detail)

    def quote(text):
        parts = ['"']
        for ch in _str.__str__(text):
            code = _ord(ch)
            if ch == '"' or ch == "\\":
                parts.append("\\" + ch)
            elif 32 <= code < 127:
                parts.append(ch)
            elif 0xD800 <= code < 0xE000:
                parts.append("\\ufffd")
            elif code < 0x10000:
                parts.append("\\u%04x" % code)
            else:
                code -= 0x10000
                parts.append("\\u%04x\\u%04x" % (0xD800 + (code >> 10), 0xDC00 + (code & 0x3FF)))
        parts.append('"')
        return "".join(parts)

    def record(index, passed, text_input, text_expected, actual, error):
        return "{" + ", ".join([
            '"fixture_index": %d' % index,
            '"passed": ' + ("true" if passed is True else "false"),
            '"input": ' + quote(text_input),
            '"expected": ' + quote(text_expected),
            '"actual": ' + quote(actual),
            '"error": ' + ("null" if error is None else quote(error)),
        ]) + "}"

    fixtures = [
{{#each fixtures}}        (b"{{this.input}}", b"{{this.expected}}"),
{{/each}}    ]
    records = []
    for index, (raw_input, raw_expected) in _enumerate(fixtures):
        text_input = raw_input.decode("utf-8")
        text_expected = raw_expected.decode("utf-8")
        try:
            expected = literal(parse(text_expected.strip()))
            actual = value(parse(text_input.strip()))
            passed = same(actual, expected)
            records.append(record(index, passed, text_input, text_expected, show(actual), None))
        except _MemoryError:
            raise
        except _BaseException as exc:
            records.append(record(index, False, text_input, text_expected, "", describe(exc)))

    try:
        _sys.stdout.flush()
    except _BaseException:
        pass
    out = _open(1, "w", encoding="ascii", closefd=False)
    out.write("\n{{sentinel}}[" + ", ".join(records) + "]\n")
    out.flush()


__codedrill_main()
"#;

/// Longest `repr` of an actual value carried back in the payload.
const MAX_REPR_CHARS: usize = 2000;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("harness template is invalid: {0}")]
    Template(#[from] Box<handlebars::TemplateError>),
    #[error("failed to render harness: {0}")]
    Render(#[from] handlebars::RenderError),
}

/// A rendered harness ready for a sandbox.
#[derive(Debug, Clone)]
pub struct HarnessUnit {
    pub program: String,
    pub sentinel: String,
    pub fixture_count: usize,
}

/// Fixture text as the body of a Python bytes literal, every byte escaped.
#[derive(Serialize)]
struct WireFixture {
    input: String,
    expected: String,
}

#[derive(Serialize)]
struct TemplateData<'a> {
    submission: &'a str,
    fixtures: Vec<WireFixture>,
    sentinel: &'a str,
    max_repr: usize,
}

/// `\xNN` for every byte, so no fixture text ever reaches the program as
/// source.
fn escape_bytes(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 4);
    for byte in text.bytes() {
        out.push_str(&format!("\\x{:02x}", byte));
    }
    out
}

pub struct HarnessGenerator {
    registry: Handlebars<'static>,
}

impl HarnessGenerator {
    pub fn new() -> Result<Self, HarnessError> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_escape_fn(handlebars::no_escape);
        registry
            .register_template_string(HARNESS_TEMPLATE_NAME, HARNESS_TEMPLATE)
            .map_err(Box::new)?;
        Ok(Self { registry })
    }

    pub fn build(&self, source: &str, fixtures: &[&TestFixture]) -> Result<HarnessUnit, HarnessError> {
        let wire: Vec<WireFixture> = fixtures
            .iter()
            .map(|f| WireFixture {
                input: escape_bytes(&f.input),
                expected: escape_bytes(&f.expected),
            })
            .collect();

        let sentinel = new_sentinel();
        let data = TemplateData {
            submission: source,
            fixtures: wire,
            sentinel: &sentinel,
            max_repr: MAX_REPR_CHARS,
        };
        let program = self.registry.render(HARNESS_TEMPLATE_NAME, &data)?;

        Ok(HarnessUnit {
            program,
            sentinel,
            fixture_count: fixtures.len(),
        })
    }
}
