//! Class binding walkthrough
//!
//! **Covers:**
//! - A shared class (`Rc`) whose instances native code and script both hold
//! - An exclusively owned class (`Box`) that native code takes back from script
//! - A trait-object base class, so one native method accepts every subclass
//! - A host object lent to script for one call only
//! - A script callback retained by native code and invoked later
//!
//! Run with `cargo run -p latch_runtime --example bind_class`.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use latch_script::{
    define_class, Bindable, Bridge, Inspector, Polymorphic, Ref, ScriptError, ScriptFunction,
};

// ============================================================================
// SHAPES (polymorphic base)
// ============================================================================

trait Shape: Polymorphic {
    fn area(&self) -> f64;
    fn label(&self) -> String;
}

define_class!(dyn Shape, "Geometry.Shape", polymorphic);

impl Bindable for dyn Shape {
    fn inspect<I: Inspector<Self>>(i: &mut I) {
        i.method("area", <dyn Shape>::area);
        i.property_readonly("label", <dyn Shape>::label);
    }
}

struct Circle {
    radius: Cell<f64>,
}

define_class!(Circle: dyn Shape, "Geometry.Circle");

impl Shape for Circle {
    fn area(&self) -> f64 {
        std::f64::consts::PI * self.radius.get() * self.radius.get()
    }

    fn label(&self) -> String {
        format!("circle r={}", self.radius.get())
    }
}

impl Bindable for Circle {
    fn inspect<I: Inspector<Self>>(i: &mut I) {
        i.construct_shared(|radius: f64| {
            Rc::new(Circle {
                radius: Cell::new(radius),
            })
        });
        i.property(
            "radius",
            |circle: &Circle| circle.radius.get(),
            |circle: &Circle, radius: f64| circle.radius.set(radius),
        );
    }
}

struct Rect {
    width: f64,
    height: f64,
}

define_class!(Rect: dyn Shape, "Geometry.Rect");

impl Shape for Rect {
    fn area(&self) -> f64 {
        self.width * self.height
    }

    fn label(&self) -> String {
        format!("rect {}x{}", self.width, self.height)
    }
}

impl Bindable for Rect {
    fn inspect<I: Inspector<Self>>(i: &mut I) {
        i.construct_shared(|width: f64, height: f64| Rc::new(Rect { width, height }));
    }
}

// ============================================================================
// CARGO (exclusively owned)
// ============================================================================

#[derive(Debug)]
struct Crate {
    contents: RefCell<Vec<String>>,
}

define_class!(Crate, "Cargo.Crate");

impl Bindable for Crate {
    fn inspect<I: Inspector<Self>>(i: &mut I) {
        i.construct_exclusive(|| {
            Box::new(Crate {
                contents: RefCell::new(Vec::new()),
            })
        });
        i.method("pack", |cargo: &Crate, item: String| cargo.contents.borrow_mut().push(item));
    }
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> Result<(), ScriptError> {
    println!("=== Class binding walkthrough ===\n");

    let bridge = Bridge::new()?;
    bridge.register_class::<dyn Shape>()?;
    bridge.register_class::<Circle>()?;
    bridge.register_class::<Rect>()?;
    bridge.register_class::<Crate>()?;
    bridge.register_function("describe", |shape: Ref<dyn Shape>| {
        format!("{} has area {:.2}", shape.label(), shape.area())
    })?;
    bridge.register_function("unitCircle", || {
        Rc::new(Circle {
            radius: Cell::new(1.0),
        }) as Rc<dyn Shape>
    })?;

    println!("1. Base-class methods work on every subclass...");
    let line: String = bridge.eval(
        "const shapes = [new Geometry.Circle(1), new Geometry.Rect(2, 3)];
         shapes.map(s => describe(s)).join('; ')",
    )?;
    println!("   {line}");

    println!("\n2. Script and native code share one circle...");
    let circle: Rc<Circle> = bridge.eval("const c = new Geometry.Circle(2); c")?;
    circle.radius.set(5.0);
    let radius: f64 = bridge.eval("c.radius")?;
    println!("   native set radius to 5, script reads {radius}");

    println!("\n3. A shape stored as its base comes back as its concrete type...");
    let shape: Rc<dyn Shape> = bridge.eval("const unit = unitCircle(); unit")?;
    let concrete: Rc<Circle> = bridge.eval("unit")?;
    println!("   {} / circle radius {}", shape.label(), concrete.radius.get());

    println!("\n4. Native code takes an exclusive object back from script...");
    let cargo: Box<Crate> = bridge.eval("const box = new Cargo.Crate(); box.pack('ore'); box.pack('ice'); box")?;
    println!("   crate holds {:?}", cargo.contents.borrow());
    let reuse: Result<bool, ScriptError> = bridge.eval("box.pack('gold'); true");
    println!("   script touching it afterwards: {}", reuse.map_or_else(|e| e.to_string(), |_| "ok".into()));

    println!("\n5. Lending a host object for a single call...");
    let stack_circle = Circle {
        radius: Cell::new(0.5),
    };
    let area = bridge.with_ref(&stack_circle, |frame, index| {
        frame.push_global_object();
        frame.get_required_prop(-1, "describe")?;
        frame.dup(index)?;
        frame.call(1)?;
        frame.get::<String>(-1)
    })?;
    println!("   {area}");

    println!("\n6. Keeping a script callback for later...");
    let on_hit: ScriptFunction<(i32,), String> =
        bridge.eval("(damage) => `hit for ${damage}, ${shapes.length} shapes left`")?;
    bridge.eval_void("shapes.pop()")?;
    println!("   {}", on_hit.call((12,))?);

    drop((circle, shape, concrete));
    bridge.eval_void("shapes.length = 0")?;
    bridge.run_gc();
    println!(
        "\nboxes alive: {}, handles alive: {}",
        bridge.box_count(),
        bridge.handle_count()
    );

    Ok(())
}
