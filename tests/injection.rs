//! Field injection through the coordinator and typed access through capability slots.

mod common;

use cilsplice::{
    patch::{recorded_ids, FailureReason, SkipReason},
    prelude::*,
};
use common::{host, MODULE};

fn counter() -> PatchDescriptor {
    PatchDescriptor::inject_field(
        "foo-counter",
        "Foo",
        FieldSpec::new("counter", TypeDescriptor::int32()),
    )
}

#[test]
fn test_injected_field_is_recorded() -> Result<()> {
    let mut image = host();
    let mut coordinator = PatchCoordinator::new();

    let report = coordinator.apply_all(&mut image, &[counter()])?;
    assert_eq!(report.applied.len(), 1);
    assert!(report.is_clean());

    let foo = image.find_type("Foo").unwrap();
    let field = foo.field("counter").unwrap();
    assert_eq!(field.field_type, TypeDescriptor::int32());
    assert!(!field.is_static());
    assert_eq!(recorded_ids(&image), vec![counter().identity()]);
    Ok(())
}

#[test]
fn test_collision_with_other_type_fails() -> Result<()> {
    let mut image = host();
    let mut coordinator = PatchCoordinator::new();

    // Game.Player already declares `hp` as int32
    let clash = PatchDescriptor::inject_field(
        "player-hp",
        "Game.Player",
        FieldSpec::new("hp", "float64".parse()?),
    );
    let report = coordinator.apply_all(&mut image, &[clash])?;

    assert!(report.applied.is_empty());
    assert!(matches!(
        report.failed[0].reason,
        FailureReason::Error(Error::FieldNameCollision { .. })
    ));
    assert_eq!(image.find_type("Game.Player").unwrap().fields.len(), 1);
    Ok(())
}

#[test]
fn test_identical_field_is_skipped() -> Result<()> {
    let mut image = host();
    let mut coordinator = PatchCoordinator::new();

    let same = PatchDescriptor::inject_field(
        "player-hp",
        "Game.Player",
        FieldSpec::new("hp", TypeDescriptor::int32()),
    );
    let report = coordinator.apply_all(&mut image, &[same])?;

    assert!(report.is_clean());
    assert_eq!(report.skipped[0].reason, SkipReason::FieldPresent);
    Ok(())
}

#[test]
fn test_missing_type_leaves_image_untouched() -> Result<()> {
    let mut image = host();
    let before = image.to_bytes()?;
    let mut coordinator = PatchCoordinator::new();

    let stale = PatchDescriptor::inject_field(
        "enemy-armor",
        "Game.Enemy",
        FieldSpec::new("armor", TypeDescriptor::int32()),
    );
    let report = coordinator.apply_all(&mut image, &[stale])?;

    assert!(matches!(
        report.failed[0].reason,
        FailureReason::Error(Error::TypeNotFound(ref name)) if name == "Game.Enemy"
    ));
    assert!(!report.changed());
    assert_eq!(image, host());
    assert_eq!(image.to_bytes()?, before);
    Ok(())
}

#[test]
fn test_explicit_offset_needs_layout() -> Result<()> {
    let mut image = host();
    let mut coordinator = PatchCoordinator::new();

    let patches = [
        PatchDescriptor::inject_field(
            "foo-offset",
            "Foo",
            FieldSpec::new("packed", TypeDescriptor::int32()).at_offset(8),
        ),
        PatchDescriptor::inject_field(
            "player-offset",
            "Game.Player",
            FieldSpec::new("armor", TypeDescriptor::int32()).at_offset(4),
        ),
    ];
    let report = coordinator.apply_all(&mut image, &patches)?;

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].name, "foo-offset");
    assert!(matches!(
        report.failed[0].reason,
        FailureReason::Error(Error::LayoutMismatch(_))
    ));
    assert_eq!(report.applied[0].name, "player-offset");

    let armor = image.find_type("Game.Player").unwrap().field("armor").unwrap();
    assert_eq!(armor.offset, Some(4));
    Ok(())
}

#[test]
fn test_capability_slot_after_install() -> Result<()> {
    let runtime = Runtime::new();
    runtime.load(host())?;
    let stale = runtime.instantiate(MODULE, "Foo")?;

    // not installed yet
    assert!(matches!(
        CapabilitySlot::<i32>::bind(&runtime, MODULE, "Foo", "counter"),
        Err(Error::CapabilityMissing { .. })
    ));

    let mut coordinator = PatchCoordinator::with_config(PatchConfig::in_memory());
    let report = coordinator.install(&runtime, MODULE, &[counter()])?;
    assert!(report.changed());

    let slot: CapabilitySlot<i32> = CapabilitySlot::bind(&runtime, MODULE, "Foo", "counter")?;
    let foo = runtime.instantiate(MODULE, "Foo")?;
    assert_eq!(slot.get(&foo)?, 0);
    slot.set(&foo, 5)?;
    assert_eq!(slot.get(&foo)?, 5);

    assert!(matches!(slot.get(&stale), Err(Error::CapabilityMissing { .. })));
    assert!(matches!(
        CapabilitySlot::<bool>::bind(&runtime, MODULE, "Foo", "counter"),
        Err(Error::SlotTypeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn test_static_field_slot() -> Result<()> {
    let runtime = Runtime::new();
    runtime.load(host())?;

    let bonus = PatchDescriptor::inject_field(
        "score-bonus",
        "Game.Score",
        FieldSpec::new("bonus", TypeDescriptor::int32()).static_field(),
    );
    PatchCoordinator::with_config(PatchConfig::in_memory()).install(&runtime, MODULE, &[bonus])?;

    let slot: CapabilitySlot<i32> = CapabilitySlot::bind(&runtime, MODULE, "Game.Score", "bonus")?;
    assert!(slot.is_static());
    assert_eq!(slot.get_static(&runtime)?, 0);
    slot.set_static(&runtime, 7)?;
    assert_eq!(runtime.get_static(MODULE, "Game.Score", "bonus")?, Value::I32(7));
    Ok(())
}
