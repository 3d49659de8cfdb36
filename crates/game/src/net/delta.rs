use bitflags::bitflags;
use glam::Vec3;

use super::msg::MessageBuffer;
use super::protocol::MAX_ENTITIES;
use super::NetError;

bitflags! {
    /// Per-field change mask for entity deltas. The low byte always rides
    /// the wire; the upper two bytes are appended only when their
    /// continuation bit is set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UpdateBits: u32 {
        const ORIGIN1   = 1 << 0;
        const ORIGIN2   = 1 << 1;
        const ANGLE2    = 1 << 2;
        const ANGLE3    = 1 << 3;
        const FRAME     = 1 << 4;
        const EVENT     = 1 << 5;
        const REMOVE    = 1 << 6;
        const MORE1     = 1 << 7;

        const NUMBER16  = 1 << 8;
        const ORIGIN3   = 1 << 9;
        const MODEL     = 1 << 10;
        const MODEL2    = 1 << 11;
        const EFFECTS8  = 1 << 12;
        const EFFECTS16 = 1 << 13;
        const SOUND     = 1 << 14;
        const MORE2     = 1 << 15;

        const ANGLE1    = 1 << 16;
        const SKIN8     = 1 << 17;
        const SKIN16    = 1 << 18;
        const MODEL3    = 1 << 19;
        const MODEL4    = 1 << 20;
        const OLDORIGIN = 1 << 21;
        const SOLID     = 1 << 22;
        const MORE3     = 1 << 23;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PlayerBits: u8 {
        const PM_TYPE      = 1 << 0;
        const ORIGIN       = 1 << 1;
        const VELOCITY     = 1 << 2;
        const TIME         = 1 << 3;
        const FLAGS        = 1 << 4;
        const DELTA_ANGLES = 1 << 5;
        const VIEW_ANGLES  = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CmdBits: u8 {
        const ANGLE1  = 1 << 0;
        const ANGLE2  = 1 << 1;
        const ANGLE3  = 1 << 2;
        const FORWARD = 1 << 3;
        const SIDE    = 1 << 4;
        const UP      = 1 << 5;
        const BUTTONS = 1 << 6;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SoundBits: u8 {
        const ATTEN  = 1 << 0;
        const ORIGIN = 1 << 1;
        const ENTNUM = 1 << 2;
    }
}

/// Replicated entity. Number 0 is reserved as the stream terminator, so
/// the world never uses it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EntityState {
    pub number: u16,
    pub origin: Vec3,
    pub old_origin: Vec3,
    pub angles: Vec3,
    pub frame: u8,
    /// One-shot event id; zeroed every frame it is not re-sent.
    pub event: u8,
    pub effects: u32,
    pub model: u8,
    pub model2: u8,
    pub model3: u8,
    pub model4: u8,
    pub skin: u32,
    pub sound: u8,
    pub solid: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlayerState {
    pub pm_type: u8,
    pub origin: Vec3,
    pub velocity: Vec3,
    pub pm_time: u8,
    pub pm_flags: u8,
    pub delta_angles: Vec3,
    pub view_angles: Vec3,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct UserCmd {
    pub msec: u8,
    pub buttons: u8,
    pub angles: Vec3,
    pub forward: i16,
    pub side: i16,
    pub up: i16,
}

fn write_entity_bits(msg: &mut MessageBuffer, mut bits: UpdateBits) -> Result<UpdateBits, NetError> {
    if bits.bits() & 0x00ff0000 != 0 {
        bits |= UpdateBits::MORE1 | UpdateBits::MORE2;
    } else if bits.bits() & 0x0000ff00 != 0 {
        bits |= UpdateBits::MORE1;
    }

    msg.write_u8((bits.bits() & 0xff) as u8)?;
    if bits.contains(UpdateBits::MORE1) {
        msg.write_u8(((bits.bits() >> 8) & 0xff) as u8)?;
    }
    if bits.contains(UpdateBits::MORE2) {
        msg.write_u8(((bits.bits() >> 16) & 0xff) as u8)?;
    }
    Ok(bits)
}

fn write_entity_number(msg: &mut MessageBuffer, bits: UpdateBits, number: u16) -> Result<(), NetError> {
    if bits.contains(UpdateBits::NUMBER16) {
        msg.write_u16(number)
    } else {
        msg.write_u8(number as u8)
    }
}

/// Writes the changed fields of `to` against `from`. A missing `from` deltas
/// from the null state; callers pass `is_new` there so position and model
/// always make it onto the wire. `force` emits the record even when nothing
/// changed, which is how membership in a full frame is announced. An
/// unchanged, unforced entity writes nothing at all.
pub fn write_delta_entity(
    from: Option<&EntityState>,
    to: &EntityState,
    msg: &mut MessageBuffer,
    force: bool,
    is_new: bool,
) -> Result<(), NetError> {
    let null_state = EntityState::default();
    let base = from.unwrap_or(&null_state);

    if to.number == 0 || to.number as usize >= MAX_ENTITIES {
        return Err(NetError::Malformed("bad entity number"));
    }

    let mut bits = UpdateBits::empty();

    if to.origin.x != base.origin.x {
        bits |= UpdateBits::ORIGIN1;
    }
    if to.origin.y != base.origin.y {
        bits |= UpdateBits::ORIGIN2;
    }
    if to.origin.z != base.origin.z {
        bits |= UpdateBits::ORIGIN3;
    }
    if to.angles.x != base.angles.x {
        bits |= UpdateBits::ANGLE1;
    }
    if to.angles.y != base.angles.y {
        bits |= UpdateBits::ANGLE2;
    }
    if to.angles.z != base.angles.z {
        bits |= UpdateBits::ANGLE3;
    }
    if to.frame != base.frame {
        bits |= UpdateBits::FRAME;
    }
    if to.event != 0 {
        bits |= UpdateBits::EVENT;
    }
    if to.skin != base.skin {
        if to.skin < 256 {
            bits |= UpdateBits::SKIN8;
        } else if to.skin < 0x10000 {
            bits |= UpdateBits::SKIN16;
        } else {
            bits |= UpdateBits::SKIN8 | UpdateBits::SKIN16;
        }
    }
    if to.effects != base.effects {
        if to.effects < 256 {
            bits |= UpdateBits::EFFECTS8;
        } else if to.effects < 0x10000 {
            bits |= UpdateBits::EFFECTS16;
        } else {
            bits |= UpdateBits::EFFECTS8 | UpdateBits::EFFECTS16;
        }
    }
    if to.model != base.model {
        bits |= UpdateBits::MODEL;
    }
    if to.model2 != base.model2 {
        bits |= UpdateBits::MODEL2;
    }
    if to.model3 != base.model3 {
        bits |= UpdateBits::MODEL3;
    }
    if to.model4 != base.model4 {
        bits |= UpdateBits::MODEL4;
    }
    if to.sound != base.sound {
        bits |= UpdateBits::SOUND;
    }
    if to.old_origin != base.old_origin {
        bits |= UpdateBits::OLDORIGIN;
    }
    if to.solid != base.solid {
        bits |= UpdateBits::SOLID;
    }

    if is_new {
        bits |= UpdateBits::ORIGIN1
            | UpdateBits::ORIGIN2
            | UpdateBits::ORIGIN3
            | UpdateBits::MODEL;
    }

    if bits.is_empty() && !force {
        return Ok(());
    }

    if to.number > 255 {
        bits |= UpdateBits::NUMBER16;
    }

    let bits = write_entity_bits(msg, bits)?;
    write_entity_number(msg, bits, to.number)?;

    if bits.contains(UpdateBits::MODEL) {
        msg.write_u8(to.model)?;
    }
    if bits.contains(UpdateBits::MODEL2) {
        msg.write_u8(to.model2)?;
    }
    if bits.contains(UpdateBits::MODEL3) {
        msg.write_u8(to.model3)?;
    }
    if bits.contains(UpdateBits::MODEL4) {
        msg.write_u8(to.model4)?;
    }
    if bits.contains(UpdateBits::FRAME) {
        msg.write_u8(to.frame)?;
    }
    if bits.contains(UpdateBits::SKIN8 | UpdateBits::SKIN16) {
        msg.write_u32(to.skin)?;
    } else if bits.contains(UpdateBits::SKIN8) {
        msg.write_u8(to.skin as u8)?;
    } else if bits.contains(UpdateBits::SKIN16) {
        msg.write_u16(to.skin as u16)?;
    }
    if bits.contains(UpdateBits::EFFECTS8 | UpdateBits::EFFECTS16) {
        msg.write_u32(to.effects)?;
    } else if bits.contains(UpdateBits::EFFECTS8) {
        msg.write_u8(to.effects as u8)?;
    } else if bits.contains(UpdateBits::EFFECTS16) {
        msg.write_u16(to.effects as u16)?;
    }
    if bits.contains(UpdateBits::ORIGIN1) {
        msg.write_coord(to.origin.x)?;
    }
    if bits.contains(UpdateBits::ORIGIN2) {
        msg.write_coord(to.origin.y)?;
    }
    if bits.contains(UpdateBits::ORIGIN3) {
        msg.write_coord(to.origin.z)?;
    }
    if bits.contains(UpdateBits::ANGLE1) {
        msg.write_angle(to.angles.x)?;
    }
    if bits.contains(UpdateBits::ANGLE2) {
        msg.write_angle(to.angles.y)?;
    }
    if bits.contains(UpdateBits::ANGLE3) {
        msg.write_angle(to.angles.z)?;
    }
    if bits.contains(UpdateBits::OLDORIGIN) {
        msg.write_pos(to.old_origin)?;
    }
    if bits.contains(UpdateBits::SOUND) {
        msg.write_u8(to.sound)?;
    }
    if bits.contains(UpdateBits::EVENT) {
        msg.write_u8(to.event)?;
    }
    if bits.contains(UpdateBits::SOLID) {
        msg.write_u16(to.solid)?;
    }

    Ok(())
}

/// Announces that an entity left the active set.
pub fn write_remove_entity(number: u16, msg: &mut MessageBuffer) -> Result<(), NetError> {
    if number == 0 || number as usize >= MAX_ENTITIES {
        return Err(NetError::Malformed("bad entity number"));
    }
    let mut bits = UpdateBits::REMOVE;
    if number > 255 {
        bits |= UpdateBits::NUMBER16;
    }
    let bits = write_entity_bits(msg, bits)?;
    write_entity_number(msg, bits, number)
}

/// Reads the leading mask and entity number of the next record. Number 0
/// terminates the stream.
pub fn read_entity_bits(msg: &mut MessageBuffer) -> Result<(UpdateBits, u16), NetError> {
    let mut total = msg.read_u8()? as u32;
    if total & UpdateBits::MORE1.bits() != 0 {
        total |= (msg.read_u8()? as u32) << 8;
    }
    if total & UpdateBits::MORE2.bits() != 0 {
        total |= (msg.read_u8()? as u32) << 16;
    }
    let bits = UpdateBits::from_bits_retain(total);

    let number = if bits.contains(UpdateBits::NUMBER16) {
        msg.read_u16()?
    } else {
        msg.read_u8()? as u16
    };
    if number as usize >= MAX_ENTITIES {
        return Err(NetError::Malformed("bad entity number"));
    }
    Ok((bits, number))
}

/// Applies a record's flagged fields over `base`. Fields without a bit keep
/// the base value, except `event` which is one-shot.
pub fn read_delta_entity(
    base: &EntityState,
    number: u16,
    bits: UpdateBits,
    msg: &mut MessageBuffer,
) -> Result<EntityState, NetError> {
    let mut to = *base;
    to.number = number;

    if bits.contains(UpdateBits::MODEL) {
        to.model = msg.read_u8()?;
    }
    if bits.contains(UpdateBits::MODEL2) {
        to.model2 = msg.read_u8()?;
    }
    if bits.contains(UpdateBits::MODEL3) {
        to.model3 = msg.read_u8()?;
    }
    if bits.contains(UpdateBits::MODEL4) {
        to.model4 = msg.read_u8()?;
    }
    if bits.contains(UpdateBits::FRAME) {
        to.frame = msg.read_u8()?;
    }
    if bits.contains(UpdateBits::SKIN8 | UpdateBits::SKIN16) {
        to.skin = msg.read_u32()?;
    } else if bits.contains(UpdateBits::SKIN8) {
        to.skin = msg.read_u8()? as u32;
    } else if bits.contains(UpdateBits::SKIN16) {
        to.skin = msg.read_u16()? as u32;
    }
    if bits.contains(UpdateBits::EFFECTS8 | UpdateBits::EFFECTS16) {
        to.effects = msg.read_u32()?;
    } else if bits.contains(UpdateBits::EFFECTS8) {
        to.effects = msg.read_u8()? as u32;
    } else if bits.contains(UpdateBits::EFFECTS16) {
        to.effects = msg.read_u16()? as u32;
    }
    if bits.contains(UpdateBits::ORIGIN1) {
        to.origin.x = msg.read_coord()?;
    }
    if bits.contains(UpdateBits::ORIGIN2) {
        to.origin.y = msg.read_coord()?;
    }
    if bits.contains(UpdateBits::ORIGIN3) {
        to.origin.z = msg.read_coord()?;
    }
    if bits.contains(UpdateBits::ANGLE1) {
        to.angles.x = msg.read_angle()?;
    }
    if bits.contains(UpdateBits::ANGLE2) {
        to.angles.y = msg.read_angle()?;
    }
    if bits.contains(UpdateBits::ANGLE3) {
        to.angles.z = msg.read_angle()?;
    }
    if bits.contains(UpdateBits::OLDORIGIN) {
        to.old_origin = msg.read_pos()?;
    }
    if bits.contains(UpdateBits::SOUND) {
        to.sound = msg.read_u8()?;
    }
    to.event = if bits.contains(UpdateBits::EVENT) {
        msg.read_u8()?
    } else {
        0
    };
    if bits.contains(UpdateBits::SOLID) {
        to.solid = msg.read_u16()?;
    }

    Ok(to)
}

pub fn write_delta_player(
    from: &PlayerState,
    to: &PlayerState,
    msg: &mut MessageBuffer,
) -> Result<(), NetError> {
    let mut bits = PlayerBits::empty();

    if to.pm_type != from.pm_type {
        bits |= PlayerBits::PM_TYPE;
    }
    if to.origin != from.origin {
        bits |= PlayerBits::ORIGIN;
    }
    if to.velocity != from.velocity {
        bits |= PlayerBits::VELOCITY;
    }
    if to.pm_time != from.pm_time {
        bits |= PlayerBits::TIME;
    }
    if to.pm_flags != from.pm_flags {
        bits |= PlayerBits::FLAGS;
    }
    if to.delta_angles != from.delta_angles {
        bits |= PlayerBits::DELTA_ANGLES;
    }
    if to.view_angles != from.view_angles {
        bits |= PlayerBits::VIEW_ANGLES;
    }

    msg.write_u8(bits.bits())?;

    if bits.contains(PlayerBits::PM_TYPE) {
        msg.write_u8(to.pm_type)?;
    }
    if bits.contains(PlayerBits::ORIGIN) {
        msg.write_pos(to.origin)?;
    }
    if bits.contains(PlayerBits::VELOCITY) {
        msg.write_pos(to.velocity)?;
    }
    if bits.contains(PlayerBits::TIME) {
        msg.write_u8(to.pm_time)?;
    }
    if bits.contains(PlayerBits::FLAGS) {
        msg.write_u8(to.pm_flags)?;
    }
    if bits.contains(PlayerBits::DELTA_ANGLES) {
        msg.write_angle16(to.delta_angles.x)?;
        msg.write_angle16(to.delta_angles.y)?;
        msg.write_angle16(to.delta_angles.z)?;
    }
    if bits.contains(PlayerBits::VIEW_ANGLES) {
        msg.write_angle16(to.view_angles.x)?;
        msg.write_angle16(to.view_angles.y)?;
        msg.write_angle16(to.view_angles.z)?;
    }

    Ok(())
}

pub fn read_delta_player(from: &PlayerState, msg: &mut MessageBuffer) -> Result<PlayerState, NetError> {
    let bits = PlayerBits::from_bits_retain(msg.read_u8()?);
    let mut to = *from;

    if bits.contains(PlayerBits::PM_TYPE) {
        to.pm_type = msg.read_u8()?;
    }
    if bits.contains(PlayerBits::ORIGIN) {
        to.origin = msg.read_pos()?;
    }
    if bits.contains(PlayerBits::VELOCITY) {
        to.velocity = msg.read_pos()?;
    }
    if bits.contains(PlayerBits::TIME) {
        to.pm_time = msg.read_u8()?;
    }
    if bits.contains(PlayerBits::FLAGS) {
        to.pm_flags = msg.read_u8()?;
    }
    if bits.contains(PlayerBits::DELTA_ANGLES) {
        to.delta_angles.x = msg.read_angle16()?;
        to.delta_angles.y = msg.read_angle16()?;
        to.delta_angles.z = msg.read_angle16()?;
    }
    if bits.contains(PlayerBits::VIEW_ANGLES) {
        to.view_angles.x = msg.read_angle16()?;
        to.view_angles.y = msg.read_angle16()?;
        to.view_angles.z = msg.read_angle16()?;
    }

    Ok(to)
}

pub fn write_delta_cmd(from: &UserCmd, to: &UserCmd, msg: &mut MessageBuffer) -> Result<(), NetError> {
    let mut bits = CmdBits::empty();

    if to.angles.x != from.angles.x {
        bits |= CmdBits::ANGLE1;
    }
    if to.angles.y != from.angles.y {
        bits |= CmdBits::ANGLE2;
    }
    if to.angles.z != from.angles.z {
        bits |= CmdBits::ANGLE3;
    }
    if to.forward != from.forward {
        bits |= CmdBits::FORWARD;
    }
    if to.side != from.side {
        bits |= CmdBits::SIDE;
    }
    if to.up != from.up {
        bits |= CmdBits::UP;
    }
    if to.buttons != from.buttons {
        bits |= CmdBits::BUTTONS;
    }

    msg.write_u8(bits.bits())?;

    if bits.contains(CmdBits::ANGLE1) {
        msg.write_angle16(to.angles.x)?;
    }
    if bits.contains(CmdBits::ANGLE2) {
        msg.write_angle16(to.angles.y)?;
    }
    if bits.contains(CmdBits::ANGLE3) {
        msg.write_angle16(to.angles.z)?;
    }
    if bits.contains(CmdBits::FORWARD) {
        msg.write_i16(to.forward)?;
    }
    if bits.contains(CmdBits::SIDE) {
        msg.write_i16(to.side)?;
    }
    if bits.contains(CmdBits::UP) {
        msg.write_i16(to.up)?;
    }
    if bits.contains(CmdBits::BUTTONS) {
        msg.write_u8(to.buttons)?;
    }

    msg.write_u8(to.msec)
}

pub fn read_delta_cmd(from: &UserCmd, msg: &mut MessageBuffer) -> Result<UserCmd, NetError> {
    let bits = CmdBits::from_bits_retain(msg.read_u8()?);
    let mut to = *from;

    if bits.contains(CmdBits::ANGLE1) {
        to.angles.x = msg.read_angle16()?;
    }
    if bits.contains(CmdBits::ANGLE2) {
        to.angles.y = msg.read_angle16()?;
    }
    if bits.contains(CmdBits::ANGLE3) {
        to.angles.z = msg.read_angle16()?;
    }
    if bits.contains(CmdBits::FORWARD) {
        to.forward = msg.read_i16()?;
    }
    if bits.contains(CmdBits::SIDE) {
        to.side = msg.read_i16()?;
    }
    if bits.contains(CmdBits::UP) {
        to.up = msg.read_i16()?;
    }
    if bits.contains(CmdBits::BUTTONS) {
        to.buttons = msg.read_u8()?;
    }

    to.msec = msg.read_u8()?;
    Ok(to)
}
