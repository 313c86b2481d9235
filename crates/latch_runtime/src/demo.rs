//! Demo bindings the runner exposes to every script
//!
//! - `SpaceInvaders.Spaceship`: a shared native class with methods and accessors
//! - `SpaceInvaders.Direction`: frozen constants backed by a Rust enum
//! - `Vec2`: a plain value codec, copied as `{ x, y }`
//! - `log(message)`: forwards to the host log

use std::cell::Cell;
use std::rc::Rc;

use latch_script::{define_class, Bindable, Bridge, Frame, Inspector, Result, Type, TypeError};

/// Row the ships fly along
const SHIP_ROW: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vec2 {
    pub x: f64,
    pub y: f64,
}

impl Type for Vec2 {
    fn push(frame: &mut Frame<'_>, value: Self) -> Result<()> {
        let object = frame.push_object()?;
        frame.push(value.x)?;
        frame.put_prop(object, "x")?;
        frame.push(value.y)?;
        frame.put_prop(object, "y")
    }

    fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
        let index = frame.normalize(index)?;
        frame.get_required_prop(index, "x")?;
        let x = frame.get::<f64>(-1)?;
        frame.get_required_prop(index, "y")?;
        let y = frame.get::<f64>(-1)?;
        Ok(Vec2 { x, y })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Direction {
    Left = -1,
    Right = 1,
}

define_class!(Direction, "SpaceInvaders.Direction");

impl Type for Direction {
    fn push(frame: &mut Frame<'_>, value: Self) -> Result<()> {
        frame.push(value as i32)
    }

    fn get(frame: &mut Frame<'_>, index: i32) -> Result<Self> {
        match frame.get::<i32>(index)? {
            -1 => Ok(Direction::Left),
            1 => Ok(Direction::Right),
            other => Err(TypeError::shape("Direction", other.to_string()).into()),
        }
    }
}

impl Bindable for Direction {
    fn inspect<I: Inspector<Self>>(i: &mut I) {
        i.constant("Left", Direction::Left);
        i.constant("Right", Direction::Right);
    }
}

#[derive(Debug)]
pub struct Spaceship {
    pos: Cell<i32>,
    speed: Cell<i32>,
}

define_class!(Spaceship, "SpaceInvaders.Spaceship");

impl Spaceship {
    pub fn new(pos: i32) -> Self {
        Self {
            pos: Cell::new(pos),
            speed: Cell::new(1),
        }
    }

    pub fn move_left(&self) {
        self.steer(Direction::Left);
    }

    pub fn move_right(&self) {
        self.steer(Direction::Right);
    }

    pub fn steer(&self, direction: Direction) {
        let step = self.speed.get() * direction as i32;
        self.pos.set(self.pos.get() + step);
    }

    pub fn pos(&self) -> i32 {
        self.pos.get()
    }

    pub fn set_pos(&self, pos: i32) {
        self.pos.set(pos);
    }

    pub fn position(&self) -> Vec2 {
        Vec2 {
            x: f64::from(self.pos.get()),
            y: SHIP_ROW,
        }
    }
}

impl Bindable for Spaceship {
    fn inspect<I: Inspector<Self>>(i: &mut I) {
        i.construct_shared(|pos: i32| Rc::new(Spaceship::new(pos)));
        i.method("moveLeft", Spaceship::move_left);
        i.method("moveRight", Spaceship::move_right);
        i.method("steer", Spaceship::steer);
        i.property("pos", Spaceship::pos, Spaceship::set_pos);
        i.property(
            "speed",
            |ship: &Spaceship| ship.speed.get(),
            |ship: &Spaceship, speed: i32| ship.speed.set(speed),
        );
        i.property_readonly("position", Spaceship::position);
        i.constant("ROW", SHIP_ROW);
    }
}

/// Register the demo set. Value codecs go first; class members check them.
pub fn register(bridge: &Bridge) -> Result<()> {
    bridge.register_type::<Vec2>();
    bridge.register_type::<Direction>();
    bridge.register_enum::<Direction>()?;
    bridge.register_class::<Spaceship>()?;
    bridge.register_function("log", |message: String| {
        tracing::info!(target: "script", "{message}");
    })?;
    tracing::debug!("demo bindings registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> Bridge {
        let bridge = Bridge::new().unwrap();
        register(&bridge).unwrap();
        bridge
    }

    #[test]
    fn ship_moves_from_script() {
        let bridge = bridge();
        let pos = bridge
            .eval::<i32>(
                "const ship = new SpaceInvaders.Spaceship(3);
                 ship.moveLeft(); ship.moveLeft(); ship.speed = 5;
                 ship.steer(SpaceInvaders.Direction.Right);
                 ship.pos",
            )
            .unwrap();
        assert_eq!(pos, 6);
    }

    #[test]
    fn position_is_a_plain_value() {
        let bridge = bridge();
        let position = bridge
            .eval::<Vec2>("new SpaceInvaders.Spaceship(7).position")
            .unwrap();
        assert_eq!(position, Vec2 { x: 7.0, y: SHIP_ROW });
    }

    #[test]
    fn directions_are_frozen() {
        let bridge = bridge();
        let rejected = bridge
            .eval::<bool>(
                "try { SpaceInvaders.Direction.Left = 5; false }
                 catch (e) { e instanceof TypeError }",
            )
            .unwrap();
        assert!(rejected);
        let left = bridge.eval::<Direction>("SpaceInvaders.Direction.Left").unwrap();
        assert_eq!(left, Direction::Left);
        assert!(bridge.eval::<bool>("Object.isFrozen(SpaceInvaders.Direction)").unwrap());
    }

    #[test]
    fn bad_direction_is_a_type_error() {
        let bridge = bridge();
        let caught = bridge
            .eval::<bool>(
                "try { new SpaceInvaders.Spaceship(0).steer(3); false }
                 catch (e) { e instanceof TypeError }",
            )
            .unwrap();
        assert!(caught);
    }
}
