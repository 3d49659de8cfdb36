use glam::Vec3;

use strafe::{EntityState, PlayerState, UserCmd};

/// Integrates one user command over its duration. Just enough movement to
/// exercise state replication; game rules proper live elsewhere.
pub fn apply_cmd(entity: &mut EntityState, ps: &mut PlayerState, cmd: &UserCmd) {
    let dt = cmd.msec as f32 / 1000.0;
    let yaw = (cmd.angles.y + ps.delta_angles.y).to_radians();
    let (sin_yaw, cos_yaw) = yaw.sin_cos();

    let forward = Vec3::new(cos_yaw, sin_yaw, 0.0);
    let right = Vec3::new(sin_yaw, -cos_yaw, 0.0);

    ps.velocity = forward * cmd.forward as f32 + right * cmd.side as f32;
    ps.velocity.z = cmd.up as f32;
    ps.origin += ps.velocity * dt;
    ps.view_angles = cmd.angles;

    entity.origin = ps.origin;
    entity.angles = Vec3::new(cmd.angles.x, cmd.angles.y, 0.0);
}
