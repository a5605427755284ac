use nalgebra::{Matrix3, Matrix4, Point3, Rotation3, UnitQuaternion, Vector3, Vector4};

/// 平行判定の閾値
const PARALLEL_EPS: f32 = 1e-6;

/// 変換行列の並進成分
pub fn translation_of(m: &Matrix4<f32>) -> Vector3<f32> {
    Vector3::new(m[(0, 3)], m[(1, 3)], m[(2, 3)])
}

/// 並進のみの変換行列
pub fn translation(v: &Vector3<f32>) -> Matrix4<f32> {
    Matrix4::new_translation(v)
}

/// 各軸のスケール（3x3部分の列ベクトル長）
pub fn scale_of(m: &Matrix4<f32>) -> Vector3<f32> {
    Vector3::new(
        m.fixed_view::<3, 1>(0, 0).norm(),
        m.fixed_view::<3, 1>(0, 1).norm(),
        m.fixed_view::<3, 1>(0, 2).norm(),
    )
}

/// スケールを除去した回転成分
pub fn rotation_of(m: &Matrix4<f32>) -> UnitQuaternion<f32> {
    let scale = scale_of(m);
    let mut r: Matrix3<f32> = m.fixed_view::<3, 3>(0, 0).into_owned();
    for c in 0..3 {
        if scale[c] > PARALLEL_EPS {
            let mut col = r.column_mut(c);
            col /= scale[c];
        }
    }
    UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(r))
}

/// 平行移動・回転・スケールから変換行列を合成 (T * R * S)
pub fn compose(position: &Vector3<f32>, rotation: &UnitQuaternion<f32>, scale: &Vector3<f32>) -> Matrix4<f32> {
    translation(position) * rotation.to_homogeneous() * Matrix4::new_nonuniform_scaling(scale)
}

/// 変換行列が単位行列か
pub fn is_identity(m: &Matrix4<f32>) -> bool {
    (m - Matrix4::identity()).iter().all(|v| v.abs() < PARALLEL_EPS)
}

/// 光線
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ray {
    pub origin: Vector3<f32>,
    /// 正規化済みの方向
    pub direction: Vector3<f32>,
}

/// 奥行き参照平面
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthPlane {
    pub position: Vector3<f32>,
    pub normal: Vector3<f32>,
}

impl DepthPlane {
    /// カメラから `target` を向く平面（法線はターゲット→カメラ方向）
    pub fn facing_camera(camera_position: &Vector3<f32>, target: Vector3<f32>) -> Self {
        let normal = (camera_position - target)
            .try_normalize(PARALLEL_EPS)
            .unwrap_or_else(Vector3::zeros);
        Self {
            position: target,
            normal,
        }
    }
}

/// 光線と平面の交点
///
/// 平行、または交点がカメラ後方にある場合は None。
pub fn ray_plane_intersection(ray: &Ray, plane: &DepthPlane) -> Option<Vector3<f32>> {
    let denom = plane.normal.dot(&ray.direction);
    if denom.abs() < PARALLEL_EPS {
        return None;
    }
    let t = plane.normal.dot(&(plane.position - ray.origin)) / denom;
    if t < 0.0 {
        return None;
    }
    Some(ray.origin + ray.direction * t)
}

/// 1フレーム分のカメラ状態
///
/// スクリーン座標は左上原点の正規化座標 (0.0〜1.0)。
#[derive(Debug, Clone, PartialEq)]
pub struct CameraFrame {
    pub position: Vector3<f32>,
    pub forward: Vector3<f32>,
    pub view: Matrix4<f32>,
    pub projection: Matrix4<f32>,
    /// ビューポートサイズ（ピクセル）
    pub viewport: (f32, f32),
}

impl CameraFrame {
    /// 位置・注視点・垂直画角からカメラを構築
    ///
    /// - fov_v_deg: 垂直画角（度）
    /// - width, height: ビューポート解像度
    pub fn look_at(
        position: Vector3<f32>,
        target: Vector3<f32>,
        fov_v_deg: f32,
        width: u32,
        height: u32,
    ) -> Self {
        let w = width as f32;
        let h = height as f32;
        let eye = Point3::from(position);
        let view = Matrix4::look_at_rh(&eye, &Point3::from(target), &Vector3::y());
        let projection = Matrix4::new_perspective(w / h, fov_v_deg.to_radians(), 0.01, 100.0);
        let forward = (target - position)
            .try_normalize(PARALLEL_EPS)
            .unwrap_or_else(|| -Vector3::z());
        Self {
            position,
            forward,
            view,
            projection,
            viewport: (w, h),
        }
    }

    pub fn view_projection(&self) -> Matrix4<f32> {
        self.projection * self.view
    }

    /// ウィンドウ座標 (ピクセル, depth 0=near 1=far) をワールド座標へ逆投影
    pub fn unproject(&self, win_x: f32, win_y: f32, depth: f32) -> Option<Vector3<f32>> {
        let (w, h) = self.viewport;
        if w <= 0.0 || h <= 0.0 {
            return None;
        }
        let inv = self.view_projection().try_inverse()?;
        let ndc = Vector4::new(
            2.0 * win_x / w - 1.0,
            1.0 - 2.0 * win_y / h,
            2.0 * depth - 1.0,
            1.0,
        );
        let world = inv * ndc;
        if world.w.abs() < PARALLEL_EPS {
            return None;
        }
        Some(world.xyz() / world.w)
    }

    /// 正規化スクリーン座標を通る視線
    pub fn screen_ray(&self, x: f32, y: f32) -> Option<Ray> {
        let (w, h) = self.viewport;
        let near = self.unproject(x * w, y * h, 0.0)?;
        let far = self.unproject(x * w, y * h, 1.0)?;
        let direction = (far - near).try_normalize(PARALLEL_EPS)?;
        Some(Ray {
            origin: near,
            direction,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn origin_camera() -> CameraFrame {
        // 原点から -Z を向くカメラ
        CameraFrame::look_at(Vector3::zeros(), Vector3::new(0.0, 0.0, -1.0), 60.0, 640, 480)
    }

    #[test]
    fn test_center_ray_points_forward() {
        let cam = origin_camera();
        let ray = cam.screen_ray(0.5, 0.5).unwrap();
        assert_relative_eq!(ray.direction, Vector3::new(0.0, 0.0, -1.0), epsilon = 1e-4);
    }

    #[test]
    fn test_screen_top_left_is_up_left() {
        let cam = origin_camera();
        let ray = cam.screen_ray(0.1, 0.1).unwrap();
        assert!(ray.direction.x < 0.0);
        assert!(ray.direction.y > 0.0);
    }

    #[test]
    fn test_mirrored_rays_hit_plane_symmetrically() {
        let cam = origin_camera();
        let plane = DepthPlane {
            position: Vector3::new(0.0, 0.0, -2.0),
            normal: Vector3::z(),
        };
        let right = ray_plane_intersection(&cam.screen_ray(0.75, 0.5).unwrap(), &plane).unwrap();
        let left = ray_plane_intersection(&cam.screen_ray(0.25, 0.5).unwrap(), &plane).unwrap();
        assert!(right.x > 0.0);
        assert_relative_eq!(left.x, -right.x, epsilon = 1e-4);
        assert_relative_eq!(right.y, 0.0, epsilon = 1e-4);
        assert_relative_eq!(right.z, -2.0, epsilon = 1e-4);
    }

    #[test]
    fn test_ray_plane_parallel_misses() {
        let ray = Ray {
            origin: Vector3::zeros(),
            direction: Vector3::x(),
        };
        let plane = DepthPlane {
            position: Vector3::new(0.0, 0.0, -1.0),
            normal: Vector3::z(),
        };
        assert!(ray_plane_intersection(&ray, &plane).is_none());
    }

    #[test]
    fn test_ray_plane_behind_misses() {
        let ray = Ray {
            origin: Vector3::zeros(),
            direction: Vector3::z(),
        };
        let plane = DepthPlane {
            position: Vector3::new(0.0, 0.0, -1.0),
            normal: Vector3::z(),
        };
        assert!(ray_plane_intersection(&ray, &plane).is_none());
    }

    #[test]
    fn test_rotation_of_ignores_scale() {
        let rot = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.7);
        let m = compose(&Vector3::new(1.0, 2.0, 3.0), &rot, &Vector3::new(2.0, 2.0, 2.0));
        assert_relative_eq!(translation_of(&m), Vector3::new(1.0, 2.0, 3.0), epsilon = 1e-6);
        assert_relative_eq!(scale_of(&m), Vector3::new(2.0, 2.0, 2.0), epsilon = 1e-5);
        assert!(rotation_of(&m).angle_to(&rot) < 1e-4);
    }

    #[test]
    fn test_is_identity() {
        assert!(is_identity(&Matrix4::identity()));
        assert!(!is_identity(&translation(&Vector3::new(0.0, 0.1, 0.0))));
    }

    #[test]
    fn test_plane_facing_camera() {
        let plane = DepthPlane::facing_camera(&Vector3::zeros(), Vector3::new(0.0, 0.0, -1.0));
        assert_relative_eq!(plane.normal, Vector3::z(), epsilon = 1e-6);
    }
}
