//! Class registration: inheritance through trait objects, namespaces,
//! constants and the construction protocol.

use std::cell::Cell;
use std::rc::Rc;

use latch_script::{
    define_class, Bindable, Bridge, Inspector, Polymorphic, Ref, ScriptError, TypeError,
};

trait Animal: Polymorphic {
    fn speak(&self) -> String;

    fn legs(&self) -> u32 {
        4
    }
}

define_class!(dyn Animal, "Zoo.Animal", polymorphic);

impl Bindable for dyn Animal {
    fn inspect<I: Inspector<Self>>(i: &mut I) {
        i.method("speak", <dyn Animal>::speak);
        i.property_readonly("legs", <dyn Animal>::legs);
    }
}

struct Dog {
    tricks: Cell<u32>,
}

define_class!(Dog: dyn Animal, "Zoo.Dog");

impl Animal for Dog {
    fn speak(&self) -> String {
        "woof".to_string()
    }
}

impl Bindable for Dog {
    fn inspect<I: Inspector<Self>>(i: &mut I) {
        i.construct_shared(|| Rc::new(Dog { tricks: Cell::new(0) }));
        i.method("learn", |dog: &Dog| dog.tricks.set(dog.tricks.get() + 1));
        i.property_readonly("tricks", |dog: &Dog| dog.tricks.get());
    }
}

#[derive(Debug)]
struct Bird;

define_class!(Bird: dyn Animal, "Zoo.Bird");

impl Animal for Bird {
    fn speak(&self) -> String {
        "tweet".to_string()
    }

    fn legs(&self) -> u32 {
        2
    }
}

impl Bindable for Bird {
    fn inspect<I: Inspector<Self>>(i: &mut I) {
        i.construct_shared(|| Rc::new(Bird));
        i.static_property_readonly("species", || 10_000_u32);
    }
}

/// Never registered; instances get their members per object
struct Parrot {
    words: Vec<String>,
}

define_class!(Parrot: dyn Animal, "Zoo.Parrot");

impl Animal for Parrot {
    fn speak(&self) -> String {
        self.words.join(" ")
    }

    fn legs(&self) -> u32 {
        2
    }
}

impl Bindable for Parrot {
    fn inspect<I: Inspector<Self>>(i: &mut I) {
        i.method("vocabulary", |parrot: &Parrot| parrot.words.len() as u32);
    }
}

struct Habitat;

define_class!(Habitat, "Zoo.Habitat");

impl Bindable for Habitat {
    fn inspect<I: Inspector<Self>>(i: &mut I) {
        i.constant("Forest", 1_u8);
        i.constant("Desert", 2_u8);
        i.constant("Names", vec!["forest".to_string(), "desert".to_string()]);
    }
}

struct Keeper {
    visits: Cell<u32>,
}

define_class!(Keeper, "Zoo.Staff.Keeper");

thread_local! {
    static OPEN: Cell<bool> = const { Cell::new(true) };
}

impl Bindable for Keeper {
    fn inspect<I: Inspector<Self>>(i: &mut I) {
        i.construct_exclusive(|| Box::new(Keeper { visits: Cell::new(0) }));
        i.method("visit", |keeper: &Keeper, animal: Ref<dyn Animal>| {
            keeper.visits.set(keeper.visits.get() + 1);
            format!("{} says {}", keeper.visits.get(), animal.speak())
        });
        i.static_property(
            "open",
            || OPEN.with(Cell::get),
            |open: bool| OPEN.with(|cell| cell.set(open)),
        );
        i.static_method("hire", || Box::new(Keeper { visits: Cell::new(100) }));
    }
}

fn zoo() -> Bridge {
    let bridge = Bridge::new().unwrap();
    bridge.register_class::<dyn Animal>().unwrap();
    bridge.register_class::<Dog>().unwrap();
    bridge.register_class::<Bird>().unwrap();
    bridge.register_class::<Keeper>().unwrap();
    bridge
        .register_function("Zoo.adopt", |kind: String| -> Rc<dyn Animal> {
            match kind.as_str() {
                "dog" => Rc::new(Dog { tricks: Cell::new(0) }),
                "parrot" => Rc::new(Parrot {
                    words: vec!["hello".to_string(), "there".to_string()],
                }),
                _ => Rc::new(Bird),
            }
        })
        .unwrap();
    bridge
        .register_function("Zoo.hatch", || {
            Rc::new(Parrot {
                words: vec!["pretty".to_string()],
            })
        })
        .unwrap();
    bridge
}

#[test]
fn derived_objects_keep_their_overrides() {
    let bridge = zoo();
    let heard = bridge
        .eval::<String>(
            "[new Zoo.Dog(), new Zoo.Bird(), Zoo.adopt('bird'), Zoo.adopt('dog')]
                .map(a => a.speak() + '/' + a.legs).join(' ')",
        )
        .unwrap();
    assert_eq!(heard, "woof/4 tweet/2 tweet/2 woof/4");
    assert!(bridge
        .eval::<bool>("Object.getPrototypeOf(Zoo.Dog.prototype) === Zoo.Animal.prototype")
        .unwrap());
}

#[test]
fn base_reference_accepts_every_subclass() {
    let bridge = zoo();
    let log = bridge
        .eval::<Vec<String>>(
            "const keeper = new Zoo.Staff.Keeper();
             [new Zoo.Dog(), Zoo.adopt('bird'), Zoo.hatch()].map(a => keeper.visit(a))",
        )
        .unwrap();
    assert_eq!(log, ["1 says woof", "2 says tweet", "3 says pretty"]);
}

#[test]
fn base_handle_comes_back_as_its_concrete_class() {
    let bridge = zoo();
    bridge.eval_void("globalThis.pet = Zoo.adopt('dog'); pet.speak()").unwrap();

    let animal: Rc<dyn Animal> = bridge.get_global("pet").unwrap();
    let dog: Rc<Dog> = bridge.get_global("pet").unwrap();
    assert_eq!(animal.speak(), "woof");
    dog.tricks.set(3);
    assert_eq!(
        Rc::as_ptr(&animal) as *const (),
        Rc::as_ptr(&dog) as *const ()
    );

    let err = bridge.get_global::<Rc<Bird>>("pet").unwrap_err();
    assert_eq!(
        err,
        ScriptError::Type(TypeError::shape("Zoo.Bird", "Zoo.Animal"))
    );
}

#[test]
fn optional_read_of_another_class_is_empty() {
    let bridge = zoo();
    bridge.eval_void("globalThis.pet = Zoo.adopt('dog')").unwrap();
    let bird: Option<Rc<Bird>> = bridge.get_global("pet").unwrap();
    assert!(bird.is_none());
    let dog: Option<Rc<Dog>> = bridge.get_global("pet").unwrap();
    assert!(dog.is_some_and(|dog| dog.speak() == "woof"));

    bridge.eval_void("globalThis.keeper = new Zoo.Staff.Keeper()").unwrap();
    let wrong: Option<Box<Dog>> = bridge.get_global("keeper").unwrap();
    assert!(wrong.is_none());
    let keeper: Box<Keeper> = bridge.get_global("keeper").unwrap();
    assert_eq!(keeper.visits.get(), 0);
}

#[test]
fn base_handle_only_shows_base_members() {
    let bridge = zoo();
    let members = bridge
        .eval::<String>("const a = Zoo.adopt('dog'); typeof a.speak + ',' + typeof a.learn")
        .unwrap();
    assert_eq!(members, "function,undefined");
}

#[test]
fn unregistered_class_gets_members_per_instance() {
    let bridge = zoo();
    let callables = bridge.bound_callables();

    let summary = bridge
        .eval::<String>("globalThis.polly = Zoo.hatch(); polly.speak() + ':' + polly.vocabulary() + ':' + polly.legs")
        .unwrap();
    assert_eq!(summary, "pretty:1:2");
    assert!(bridge.bound_callables() > callables);
    assert!(bridge.eval::<bool>("Object.getPrototypeOf(Object.getPrototypeOf(polly)) === Zoo.Animal.prototype").unwrap());

    bridge.eval_void("delete globalThis.polly").unwrap();
    bridge.run_gc();
    assert_eq!(bridge.bound_callables(), callables);
    assert_eq!(bridge.box_count(), 0);
}

#[test]
fn constructor_requires_new() {
    let bridge = zoo();
    let message = bridge
        .eval::<String>("try { Zoo.Dog(); 'constructed' } catch (e) { e.name + ': ' + e.message }")
        .unwrap();
    assert_eq!(message, "TypeError: Constructor must be called with 'new'.");
}

#[test]
fn class_without_constructor_cannot_be_instantiated() {
    let bridge = zoo();
    let thrown = bridge
        .eval::<bool>("try { new Zoo.Animal(); false } catch (e) { e instanceof TypeError }")
        .unwrap();
    assert!(thrown);
}

#[test]
fn namespaces_nest_and_share_parents() {
    let bridge = zoo();
    let layout = bridge
        .eval::<String>("Object.keys(Zoo).sort().join(',') + '|' + Object.keys(Zoo.Staff).join(',')")
        .unwrap();
    assert_eq!(layout, "Animal,Bird,Dog,Staff,adopt,hatch|Keeper");
}

#[test]
fn statics_live_on_the_class_object() {
    let bridge = zoo();
    assert_eq!(bridge.eval::<u32>("Zoo.Bird.species").unwrap(), 10_000);
    assert!(bridge.eval::<bool>("Zoo.Staff.Keeper.open").unwrap());
    bridge.eval_void("Zoo.Staff.Keeper.open = false").unwrap();
    assert!(!OPEN.with(Cell::get));

    let visits = bridge
        .eval::<String>("Zoo.Staff.Keeper.hire().visit(new Zoo.Bird())")
        .unwrap();
    assert_eq!(visits, "101 says tweet");
    assert!(bridge.eval::<bool>("typeof new Zoo.Bird().species === 'undefined'").unwrap());
}

#[test]
fn constants_export_as_a_frozen_object() {
    let bridge = Bridge::new().unwrap();
    bridge.register_enum::<Habitat>().unwrap();

    assert_eq!(bridge.eval::<u8>("Zoo.Habitat.Desert").unwrap(), 2);
    assert_eq!(
        bridge.eval::<Vec<String>>("Zoo.Habitat.Names").unwrap(),
        ["forest", "desert"]
    );
    assert!(bridge.eval::<bool>("Object.isFrozen(Zoo.Habitat)").unwrap());
    let rejected = bridge
        .eval::<bool>("try { Zoo.Habitat.Swamp = 3; false } catch (e) { e instanceof TypeError }")
        .unwrap();
    assert!(rejected);
}

#[test]
fn constants_can_be_written_into_any_object() {
    let bridge = Bridge::new().unwrap();
    let keys = bridge
        .with(|frame| {
            let target = frame.push_object()?;
            frame.put_constants::<Habitat>(target)?;
            frame.dup(target)?;
            frame.put_global("settings")?;
            frame.pop()?;
            Ok(())
        })
        .and_then(|()| bridge.eval::<String>("Object.keys(settings).join(',')"))
        .unwrap();
    assert_eq!(keys, "Forest,Desert,Names");
}

#[test]
fn registering_twice_changes_nothing() {
    let bridge = zoo();
    bridge.eval_void("globalThis.marker = Zoo.Dog.prototype").unwrap();
    let callables = bridge.bound_callables();

    bridge.register_class::<Dog>().unwrap();
    assert_eq!(bridge.bound_callables(), callables);
    assert!(bridge.eval::<bool>("marker === Zoo.Dog.prototype").unwrap());
}
