#[macro_use]
mod common;

#[test]
fn classes_print_their_name() {
    assert_prints!("class Pair {} print Pair;", "Pair");
    assert_prints!("class Pair {} print Pair();", "Pair instance");
}

#[test]
fn fields_are_per_instance() {
    assert_prints!(
        r#"
        class Pair {}
        var a = Pair();
        var b = Pair();
        a.x = 1;
        b.x = 2;
        print a.x;
        print b.x;
        "#,
        "1",
        "2",
    );
}

#[test]
fn field_assignment_is_an_expression() {
    assert_prints!(
        r#"
        class Pair {}
        var p = Pair();
        print p.y = 42;
        "#,
        "42",
    );
}

#[test]
fn methods_see_their_receiver() {
    assert_prints!(
        r#"
        class Counter {
          init() { this.n = 0; }
          bump() { this.n = this.n + 1; return this.n; }
        }
        var c = Counter();
        c.bump(); c.bump();
        print c.bump();
        "#,
        "3",
    );
}

#[test]
fn initializer_arguments_set_state() {
    assert_prints!(
        r#"
        class Point {
          init(x, y) { this.x = x; this.y = y; }
          sum() { return this.x + this.y; }
        }
        print Point(40, 2).sum();
        "#,
        "42",
    );
}

#[test]
fn initializer_returns_the_instance() {
    assert_prints!(
        r#"
        class Box { init() { this.full = false; } }
        var b = Box();
        print b.full;
        "#,
        "false",
    );
    // An early bare return still yields the instance.
    assert_prints!(
        r#"
        class Box { init(v) { this.v = v; if (v) return; this.v = "defaulted"; } }
        print Box(false).v;
        print Box("given").v;
        "#,
        "defaulted",
        "given",
    );
}

#[test]
fn calling_a_class_without_init_takes_no_arguments() {
    assert_prints!("class Empty {} print Empty();", "Empty instance");
    assert_runtime_err!("class Empty {} Empty(1);");
}

#[test]
fn bound_methods_remember_their_receiver() {
    assert_prints!(
        r#"
        class Speaker {
          init(word) { this.word = word; }
          say() { print this.word; }
        }
        var hi = Speaker("hi").say;
        var yo = Speaker("yo").say;
        hi();
        yo();
        print Speaker("x").say;
        "#,
        "hi",
        "yo",
        "<fn say>",
    );
}

#[test]
fn bound_methods_can_be_stored_in_fields() {
    assert_prints!(
        r#"
        class A { m() { return "from a"; } }
        class B {}
        var b = B();
        b.stolen = A().m;
        print b.stolen();
        "#,
        "from a",
    );
}

#[test]
fn fields_shadow_methods() {
    assert_prints!(
        r#"
        class Thing {
          label() { return "method"; }
        }
        var t = Thing();
        print t.label();
        t.label = "field";
        print t.label;
        "#,
        "method",
        "field",
    );
}

#[test]
fn methods_chain_through_returned_this() {
    assert_prints!(
        r#"
        class Builder {
          init() { this.parts = ""; }
          add(p) { this.parts = this.parts + p; return this; }
          build() { return this.parts; }
        }
        print Builder().add("a").add("b").add("c").build();
        "#,
        "abc",
    );
}

#[test]
fn instances_compare_by_identity() {
    assert_prints!(
        r#"
        class Pair {}
        var a = Pair();
        var b = Pair();
        print a == a;
        print a == b;
        "#,
        "true",
        "false",
    );
}

#[test]
fn classes_nest_inside_functions() {
    assert_prints!(
        r#"
        fun makeClass(tag) {
          class Tagged {
            init() { this.tag = tag; }
            show() { print this.tag; }
          }
          return Tagged;
        }
        makeClass("first")().show();
        makeClass("second")().show();
        "#,
        "first",
        "second",
    );
}
