#[macro_use]
mod common;

#[test]
fn closures_read_enclosing_locals() {
    assert_prints!(
        r#"
        fun outer() { var x = "outside"; fun inner() { print x; } inner(); }
        outer();
        "#,
        "outside",
    );
}

#[test]
fn closures_write_enclosing_locals() {
    assert_prints!(
        r#"
        fun outer() {
          var x = 1;
          fun bump() { x = x + 1; }
          bump(); bump();
          print x;
        }
        outer();
        "#,
        "3",
    );
}

#[test]
fn two_closures_share_one_upvalue() {
    assert_prints!(
        r#"
        fun make() {
          var x = 0;
          fun inc() { x = x + 1; }
          fun get() { return x; }
          inc(); inc();
          print get();
        }
        make();
        "#,
        "2",
    );
}

#[test]
fn upvalues_survive_their_scope() {
    assert_prints!(
        r#"
        var f;
        { var x = "captured"; fun g() { print x; } f = g; }
        f();
        "#,
        "captured",
    );
}

#[test]
fn upvalues_close_over_variables_not_values() {
    assert_prints!(
        r#"
        var get;
        var set;
        fun main() {
          var state = "initial";
          fun g() { return state; }
          fun s(v) { state = v; }
          get = g;
          set = s;
        }
        main();
        set("updated");
        print get();
        "#,
        "updated",
    );
}

#[test]
fn each_call_gets_fresh_upvalues() {
    assert_prints!(
        r#"
        fun makeCounter() { var i = 0; fun c() { i = i + 1; return i; } return c; }
        var a = makeCounter();
        var b = makeCounter();
        a(); a();
        print a();
        print b();
        "#,
        "3",
        "1",
    );
}

#[test]
fn closures_capture_through_intermediate_functions() {
    assert_prints!(
        r#"
        fun outer() {
          var x = "chained";
          fun middle() {
            fun inner() { print x; }
            inner();
          }
          middle();
        }
        outer();
        "#,
        "chained",
    );
}

#[test]
fn loop_bodies_close_their_own_variable() {
    assert_prints!(
        r#"
        var first;
        var second;
        for (var i = 1; i <= 2; i = i + 1) {
          var here = i;
          fun show() { print here; }
          if (i == 1) first = show; else second = show;
        }
        first();
        second();
        "#,
        "1",
        "2",
    );
}

#[test]
fn methods_can_close_over_this() {
    assert_prints!(
        r#"
        class Box {
          init(v) { this.v = v; }
          deferred() {
            fun read() { return this.v; }
            return read;
          }
        }
        var f = Box("inside").deferred();
        print f();
        "#,
        "inside",
    );
}

#[test]
fn recursion_through_a_closure() {
    assert_prints!(
        r#"
        fun countdown(n) {
          if (n > 0) { countdown(n - 1); }
          else { print "liftoff"; }
        }
        countdown(50);
        "#,
        "liftoff",
    );
}
