//! Interpreter-level language behavior through the public engine API

use eightball::engine::{EditMode, Engine, ReplStatus};

fn engine() -> Engine<Vec<u8>> {
    Engine::new(Vec::new())
}

fn out(engine: &Engine<Vec<u8>>) -> String {
    String::from_utf8(engine.out.clone()).unwrap()
}

#[test]
fn test_multiple_statements_per_line() {
    let mut e = engine();
    assert_eq!(e.exec_line("word a=1; word b=2; pr.dec a+b"), ReplStatus::Ok);
    assert_eq!(out(&e), "3");
}

#[test]
fn test_comment_lines_do_nothing() {
    let mut e = engine();
    assert_eq!(e.exec_line("' this is a comment; pr.dec 1"), ReplStatus::Ok);
    assert_eq!(out(&e), "");
}

#[test]
fn test_unknown_statement_is_assignment_error() {
    let mut e = engine();
    assert_eq!(e.exec_line("bogus = 1"), ReplStatus::Err);
    assert!(out(&e).contains("?variable name expected"));
}

#[test]
fn test_variable_redefinition() {
    let mut e = engine();
    e.exec_line("word x = 1");
    assert_eq!(e.exec_line("word x = 2"), ReplStatus::Err);
    assert!(out(&e).contains("?variable redefined"));
}

#[test]
fn test_four_char_name_significance() {
    let mut e = engine();
    e.exec_line("word counter = 5");
    e.exec_line("pr.dec countless");
    assert_eq!(out(&e), "5");
}

#[test]
fn test_missing_equals_reports_expected() {
    let mut e = engine();
    assert_eq!(e.exec_line("word x 5"), ReplStatus::Err);
    assert!(out(&e).contains("?expected ="));
}

#[test]
fn test_trailing_junk_reports_extra() {
    let mut e = engine();
    assert_eq!(e.exec_line("pr.nl 5"), ReplStatus::Err);
    assert!(out(&e).contains("?unexpected extra"));
}

#[test]
fn test_bad_number() {
    let mut e = engine();
    assert_eq!(e.exec_line("pr.dec $zz"), ReplStatus::Err);
    assert!(out(&e).contains("?invalid number"));
}

#[test]
fn test_bad_string() {
    let mut e = engine();
    assert_eq!(e.exec_line("pr.msg \"unterminated"), ReplStatus::Err);
    assert!(out(&e).contains("?invalid string"));
}

#[test]
fn test_call_of_missing_sub() {
    let mut e = engine();
    e.program.push("call nosuch(1)");
    e.exec_line("run");
    assert!(out(&e).contains("?no sub"));
}

#[test]
fn test_return_at_prompt_is_stack_error() {
    let mut e = engine();
    assert_eq!(e.exec_line("return 0"), ReplStatus::Err);
    assert!(out(&e).contains("?stack"));
}

#[test]
fn test_call_from_prompt_runs_sub() {
    let mut e = engine();
    e.program.push("sub hello(word n); pr.dec n; pr.msg \"!\"; return 0; endsub");
    assert_eq!(e.exec_line("call hello(3)"), ReplStatus::Ok);
    assert_eq!(out(&e), "3!");
}

#[test]
fn test_function_call_from_prompt() {
    let mut e = engine();
    e.program.push("sub sq(word x); return x*x; endsub");
    assert_eq!(e.exec_line("pr.dec sq(9)"), ReplStatus::Ok);
    assert_eq!(out(&e), "81");
}

#[test]
fn test_statement_after_call_still_runs() {
    let mut e = engine();
    e.program.push("sub nop(word x); return 0; endsub");
    e.exec_line("call nop(1); pr.msg \"after\"");
    assert_eq!(out(&e), "after");
}

#[test]
fn test_while_loop_on_one_immediate_line() {
    let mut e = engine();
    e.exec_line("word n = 3");
    e.exec_line("while n > 0; pr.dec n; n = n - 1; endwhile");
    assert_eq!(out(&e), "321");
}

#[test]
fn test_editor_insert_and_append() {
    let mut e = engine();
    e.exec_line(":i 1");
    assert_eq!(e.edit, EditMode::InsertFirst);
    e.edit_line("pr.dec 1");
    e.edit_line("pr.dec 2");
    assert_eq!(e.edit, EditMode::Append);
    e.end_edit();
    assert_eq!(e.program.len(), 2);

    e.exec_line(":a 1");
    e.edit_line("pr.dec 9");
    e.end_edit();
    e.exec_line("run");
    assert_eq!(out(&e), "192");
}

#[test]
fn test_editor_append_to_missing_line() {
    let mut e = engine();
    assert_eq!(e.exec_line(":a 5"), ReplStatus::Err);
    assert!(out(&e).contains("?invalid line num"));
}

#[test]
fn test_list_empty_range_is_noop() {
    let mut e = engine();
    e.program.push("pr.dec 1");
    assert_eq!(e.exec_line(":l 5,9"), ReplStatus::Ok);
    assert_eq!(out(&e), "");
}

#[test]
fn test_delete_range() {
    let mut e = engine();
    for l in ["a=1", "b=2", "c=3", "d=4"] {
        e.program.push(l);
    }
    e.exec_line(":d 2,3");
    assert_eq!(e.program.len(), 2);
}

#[test]
fn test_new_deletes_program() {
    let mut e = engine();
    e.program.push("pr.dec 1");
    e.exec_line("new");
    assert!(e.program.is_empty());
}

#[test]
fn test_save_and_load_round_trip() {
    let path = std::env::temp_dir().join("eightball_lang_test.8b");
    let path = path.to_str().unwrap().to_string();
    let mut e = engine();
    e.program.push("word x = 41");
    e.program.push("pr.dec x + 1");
    assert_eq!(e.exec_line(&format!(":w \"{}\"", path)), ReplStatus::Ok);

    let mut e2 = engine();
    assert_eq!(e2.exec_line(&format!(":r \"{}\"", path)), ReplStatus::Ok);
    assert_eq!(e2.program.len(), 2);
    e2.exec_line("run");
    assert!(out(&e2).contains("42"));
    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_run_resets_variables() {
    let mut e = engine();
    e.program.push("word x = 1");
    e.exec_line("run");
    e.exec_line("run");
    // a redefinition error on the second run would mean state leaked
    assert!(!out(&e).contains("redefined"));
}

#[test]
fn test_error_resets_scopes() {
    let mut e = engine();
    e.program.push("sub f(word x); pr.dec 1/0; return 0; endsub");
    e.program.push("call f(1)");
    e.exec_line("run");
    assert!(out(&e).contains("?div by zero"));
    // the callee's scope must be gone: creating a fresh global works
    assert_eq!(e.exec_line("word x = 3; pr.dec x"), ReplStatus::Ok);
}

#[test]
fn test_vars_listing() {
    let mut e = engine();
    e.exec_line("word wide = 9");
    e.exec_line("byte nums[3] = 0");
    e.exec_line("vars");
    let text = out(&e);
    assert!(text.contains("wide w 9"));
    assert!(text.contains("nums[3] b"));
}

#[test]
fn test_free_reports_space() {
    let mut e = engine();
    e.exec_line("free");
    assert!(out(&e).contains("vars"));
}

#[test]
fn test_expression_too_complex() {
    let mut e = engine();
    let deep = format!("pr.dec {}1{}", "(".repeat(20), ")".repeat(20));
    assert_eq!(e.exec_line(&deep), ReplStatus::Err);
    assert!(out(&e).contains("?expr too complex"));
}

#[test]
fn test_sub_body_with_endsub_on_next_line() {
    let mut e = engine();
    e.program.push("sub add3(word a, word b, word c)");
    e.program.push("return a + b + c");
    e.program.push("endsub");
    e.program.push("pr.dec add3(1, 2, 3)");
    e.exec_line("run");
    assert_eq!(out(&e), "6");
}

#[test]
fn test_quit_signals_the_repl() {
    let mut e = engine();
    assert_eq!(e.exec_line("pr.msg \"so long\"; quit"), ReplStatus::Quit);
    assert_eq!(out(&e), "so longBye!\n");
}

#[test]
fn test_quit_from_called_sub_unwinds_to_the_prompt() {
    let mut e = engine();
    e.program.push("sub bail(word x); quit; return 0; endsub");
    e.program.push("call bail(1)");
    assert_eq!(e.exec_line("run"), ReplStatus::Quit);
    assert!(out(&e).contains("Bye!"));
}

#[test]
fn test_array_decay_on_reforwarding() {
    let mut e = engine();
    e.program.push("word a[2] = 0");
    e.program.push("sub inner(word v[]); v[1] = 5; return 0; endsub");
    e.program.push("sub outer(word v[]); call inner(v); return 0; endsub");
    e.program.push("call outer(a)");
    e.program.push("pr.dec a[1]");
    e.exec_line("run");
    assert_eq!(out(&e), "5");
}
