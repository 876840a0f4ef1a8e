mod support;

use support::{python_lock, run_fixture, run_in_tempdir};

use pyo3::prelude::*;

#[test]
fn flush_returns_warnings_in_order_exactly_once() {
    run_in_tempdir(
        "flush_order",
        r#"
import warnings
import trial_warnings as tw

buf = tw.TestWarnings("flush_order")

def body():
    warnings.warn("first", UserWarning)
    warnings.warn(message="second", category=RuntimeWarning)

buf.run(body)
assert len(buf) == 2
got = buf.flush()
assert [w.message for w in got] == ["first", "second"], got
assert got[0]["category"] is UserWarning
assert got[1].category is RuntimeWarning
assert buf.flush() == []
assert buf.flush([body]) == []
"#,
    );
}

#[test]
fn repeated_warnings_are_not_deduplicated() {
    run_in_tempdir(
        "flush_repeated",
        r#"
import warnings
import trial_warnings as tw

buf = tw.TestWarnings()

def body():
    for _ in range(2):
        warnings.warn("the message", RuntimeWarning)

buf.run(body)
assert len(buf.flush()) == 2
"#,
    );
}

#[test]
fn later_drains_see_warnings_captured_after_earlier_ones() {
    run_in_tempdir(
        "flush_multiple",
        r#"
import warnings
import trial_warnings as tw

buf = tw.TestWarnings()
seen = []

def body():
    warnings.warn("first message")
    seen.append(len(buf.flush()))
    warnings.warn("second message")
    seen.append(len(buf.flush()))

buf.run(body)
assert seen == [1, 1], seen
assert tw.flush_warnings(buf) == []
"#,
    );
}

#[test]
fn filter_claims_only_warnings_from_the_offending_function() {
    run_in_tempdir(
        "flush_filter",
        r#"
import warnings
import trial_warnings as tw

def one():
    warnings.warn("first warning text", UserWarning, stacklevel=1)

def two():
    warnings.warn("some text", RuntimeWarning, stacklevel=1)

buf = tw.TestWarnings()

def body():
    one()
    two()

buf.run(body)
first = buf.flush(offending_functions=[one])
assert [(w.message, w.category) for w in first] == [("first warning text", UserWarning)], first
assert len(buf) == 1
second = buf.flush([two])
assert [(w.message, w.category) for w in second] == [("some text", RuntimeWarning)], second
assert buf.pending() == []
"#,
    );
}

#[test]
fn warnings_at_function_edges_belong_to_the_function() {
    run_in_tempdir(
        "flush_boundaries",
        r#"
import warnings
import trial_warnings as tw

def warner():
    warnings.warn("first line warning")
    warnings.warn("internal line warning")
    warnings.warn("last line warning")

buf = tw.TestWarnings()
buf.run(warner)
assert len(buf.flush(offending_functions=[warner])) == 3

first = warner.__code__.co_firstlineno
assert all(line in tw.function_lines(warner) for line in (first + 1, first + 2, first + 3))
"#,
    );
}

#[test]
fn untaken_branches_do_not_hide_the_last_line() {
    run_in_tempdir(
        "flush_deep_branch",
        r#"
import warnings
import trial_warnings as tw

def foo(a=1, b=1):
    if a:
        if b:
            warnings.warn("oh no")
        else:
            pass

buf = tw.TestWarnings()
buf.run(foo)
assert len(buf.flush([foo])) == 1
"#,
    );
}

#[test]
fn methods_and_decorated_functions_are_valid_filters() {
    run_in_tempdir(
        "flush_methods",
        r#"
import functools
import warnings
import trial_warnings as tw

class Emitter:
    def emit(self):
        warnings.warn("from a method")

def logged(fn):
    @functools.wraps(fn)
    def wrapper(*args, **kwargs):
        return fn(*args, **kwargs)
    return wrapper

@logged
def decorated():
    warnings.warn("from a decorated function")

buf = tw.TestWarnings()

def body():
    Emitter().emit()
    decorated()

buf.run(body)
assert [w.message for w in buf.flush([decorated])] == ["from a decorated function"]
assert [w.message for w in buf.flush([Emitter().emit])] == ["from a method"]
"#,
    );
}

#[test]
fn invalid_filter_raises_and_flushes_nothing() {
    run_in_tempdir(
        "flush_invalid",
        r#"
import warnings
import trial_warnings as tw

buf = tw.TestWarnings()
buf.run(warnings.warn, "oh no")

try:
    buf.flush([None])
except tw.InvalidFilterTarget as err:
    assert isinstance(err, tw.UsageError)
    assert err.code == "ERR_INVALID_FILTER_TARGET"
    assert err.context["index"] == "0"
else:
    raise AssertionError("InvalidFilterTarget not raised")

def fine():
    pass

try:
    buf.flush([fine, len])
except tw.InvalidFilterTarget as err:
    assert err.context["index"] == "1"
else:
    raise AssertionError("builtins are not valid filters")

try:
    buf.flush(42)
except TypeError:
    pass
else:
    raise AssertionError("non-iterable filter accepted")

assert len(buf.flush()) == 1

empty = tw.TestWarnings()
try:
    empty.flush(["not a function"])
except tw.InvalidFilterTarget:
    pass
else:
    raise AssertionError("validation skipped for an empty buffer")
"#,
    );
}

#[test]
fn unflushed_warnings_replay_as_errors_when_escalated() {
    run_in_tempdir(
        "flush_as_errors",
        r#"
import warnings
import trial_warnings as tw

class CustomWarning(Warning):
    pass

saved = warnings.filters[:]
try:
    warnings.simplefilter("error")

    unflushed = tw.TestWarnings("unflushed")
    unflushed.run(warnings.warn, "some warning text", CustomWarning)
    errors = unflushed.finish()
    assert len(errors) == 1, errors
    assert isinstance(errors[0], CustomWarning)
    assert str(errors[0]) == "some warning text"
    assert unflushed.finish() == []

    flushed = tw.TestWarnings("flushed")

    def body():
        warnings.warn("some warning text", CustomWarning)
        assert len(flushed.flush()) == 1

    flushed.run(body)
    assert flushed.finish() == []
finally:
    warnings.filters[:] = saved
"#,
    );
}

#[test]
fn unflushed_warnings_reach_an_enclosing_capture() {
    run_in_tempdir(
        "flush_replay_nested",
        r#"
import warnings
import trial_warnings as tw

def test_unflushed():
    warnings.warn("some warning text")

outer = tw.TestWarnings("outer")
inner = tw.TestWarnings("inner")

def runner():
    inner.run(test_unflushed)
    assert not inner.is_active
    assert inner.finish() == []

outer.run(runner)
shown = outer.flush([test_unflushed])
assert len(shown) == 1, shown
assert shown[0]["message"] == "some warning text"
assert shown[0]["category"] is UserWarning
assert shown[0]["filename"] == test_unflushed.__code__.co_filename
assert shown[0]["lineno"] == test_unflushed.__code__.co_firstlineno + 1
"#,
    );
}

#[test]
fn discarding_policy_drops_unflushed_warnings() {
    run_in_tempdir(
        "flush_discard",
        r#"
import warnings
import trial_warnings as tw

saved = warnings.filters[:]
tw.configure_policy(replay_unflushed=False)
try:
    warnings.simplefilter("error")
    buf = tw.TestWarnings()
    buf.run(warnings.warn, "ignored")
    assert buf.finish() == []
    assert len(buf) == 0
finally:
    tw.configure_policy(replay_unflushed=True)
    warnings.filters[:] = saved
"#,
    );
}

fn package_fixture(root: &std::path::Path, package: &str, module: &str) -> std::path::PathBuf {
    let dir = root.join(package);
    std::fs::create_dir_all(&dir).expect("package dir");
    std::fs::write(dir.join("__init__.py"), "").expect("__init__");
    std::fs::write(
        dir.join(format!("{module}.py")),
        "\nimport warnings\ndef foo():\n    warnings.warn(\"oh no\")\n",
    )
    .expect("module source");
    dir
}

#[test]
fn functions_whose_source_was_deleted_can_still_be_flushed() {
    let _lock = python_lock();
    let tmp = tempfile::tempdir().expect("tempdir");
    let package = package_fixture(tmp.path(), "trial_private_helper", "missingsourcefile");
    let source = format!(
        r#"
import os
import sys
import trial_warnings as tw

sys.path.insert(0, {root:?})
try:
    from trial_private_helper import missingsourcefile
    os.remove({removed:?})

    buf = tw.TestWarnings()
    buf.run(missingsourcefile.foo)
    assert len(buf.flush([missingsourcefile.foo])) == 1
finally:
    sys.path.remove({root:?})
    sys.modules.pop("trial_private_helper", None)
    sys.modules.pop("trial_private_helper.missingsourcefile", None)
"#,
        root = tmp.path().to_string_lossy(),
        removed = package.join("missingsourcefile.py").to_string_lossy(),
    );
    Python::with_gil(|py| {
        run_fixture(py, "flush_missing_source", &tmp.path().join("driver.py"), &source)
    });
}

#[test]
fn functions_whose_source_was_renamed_can_still_be_flushed() {
    let _lock = python_lock();
    let tmp = tempfile::tempdir().expect("tempdir");
    package_fixture(tmp.path(), "trial_private_helper2", "module");
    let source = format!(
        r#"
import importlib
import os
import sys
import trial_warnings as tw

root = {root:?}
sys.path.insert(0, root)
try:
    from trial_private_helper2 import module
    del sys.modules["trial_private_helper2"]
    del sys.modules[module.__name__]
    importlib.invalidate_caches()

    os.rename(os.path.join(root, "trial_private_helper2"), os.path.join(root, "trial_renamed_helper"))
    from trial_renamed_helper import module

    buf = tw.TestWarnings()
    buf.run(module.foo)
    assert len(buf.flush([module.foo])) == 1
finally:
    sys.path.remove(root)
    sys.modules.pop("trial_renamed_helper", None)
    sys.modules.pop("trial_renamed_helper.module", None)
"#,
        root = tmp.path().to_string_lossy(),
    );
    Python::with_gil(|py| {
        run_fixture(py, "flush_renamed_source", &tmp.path().join("driver.py"), &source)
    });
}

#[test]
fn records_behave_like_mappings() {
    run_in_tempdir(
        "flush_record_api",
        r#"
import warnings
import trial_warnings as tw

buf = tw.TestWarnings("records")
buf.run(warnings.warn, "text", DeprecationWarning)
(record,) = buf.flush()
assert record.keys() == ["message", "category", "filename", "lineno"]
assert record.to_dict()["message"] == "text"
assert record.warn_explicit_kwargs()["category"] is DeprecationWarning
assert record == tw.WarningRecord("text", DeprecationWarning, record.filename, record.lineno)
assert "DeprecationWarning" in repr(record)
try:
    record["nope"]
except KeyError:
    pass
else:
    raise AssertionError("unknown key accepted")
assert buf.test_id == "records"
"#,
    );
}
