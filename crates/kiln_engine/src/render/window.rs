//! Window management using GLFW.
//!
//! Creates a no-API window for Vulkan, owns the surface glue, and answers
//! the raw key-state queries the module API exposes.

use thiserror::Error;

/// Window management errors.
#[derive(Error, Debug)]
pub enum WindowError {
    /// GLFW itself failed to initialize.
    #[error("GLFW initialization failed")]
    InitializationFailed,

    /// The window could not be created.
    #[error("window creation failed")]
    CreationFailed,

    /// Any other GLFW-reported error.
    #[error("GLFW error: {0}")]
    Glfw(String),
}

/// Result type for window operations.
pub type WindowResult<T> = Result<T, WindowError>;

/// GLFW window wrapper with Vulkan surface support.
pub struct Window {
    glfw: glfw::Glfw,
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
}

impl Window {
    /// Create a resizable window with no client API (Vulkan renders into it).
    pub fn new(title: &str, width: u32, height: u32) -> WindowResult<Self> {
        let mut glfw = glfw::init(glfw::fail_on_errors)
            .map_err(|_| WindowError::InitializationFailed)?;

        glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
        glfw.window_hint(glfw::WindowHint::Resizable(true));

        let (mut window, events) = glfw
            .create_window(width, height, title, glfw::WindowMode::Windowed)
            .ok_or(WindowError::CreationFailed)?;

        window.set_key_polling(true);
        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);

        Ok(Self {
            glfw,
            window,
            events,
        })
    }

    /// Whether the user or the app has requested closure.
    pub fn should_close(&self) -> bool {
        self.window.should_close()
    }

    /// Request closure programmatically.
    pub fn set_should_close(&mut self, should_close: bool) {
        self.window.set_should_close(should_close);
    }

    /// Process pending window-system events without blocking.
    pub fn poll_events(&mut self) {
        self.glfw.poll_events();
        // Drain the receiver; key state is queried directly, not replayed.
        for _ in glfw::flush_messages(&self.events) {}
    }

    /// Block until an event arrives. Used while the framebuffer is
    /// zero-sized (minimized) so the loop does not spin.
    pub fn wait_events(&mut self) {
        self.glfw.wait_events();
        for _ in glfw::flush_messages(&self.events) {}
    }

    /// Current framebuffer size in pixels.
    pub fn framebuffer_size(&self) -> (u32, u32) {
        let (width, height) = self.window.get_framebuffer_size();
        (width as u32, height as u32)
    }

    /// Non-blocking key-state query by ABI key code (GLFW values).
    /// Unknown codes read as released.
    pub fn is_key_down(&self, code: i32) -> bool {
        match key_from_code(code) {
            Some(key) => self.window.get_key(key) == glfw::Action::Press,
            None => false,
        }
    }

    /// Instance extensions the surface needs.
    pub fn required_instance_extensions(&self) -> WindowResult<Vec<String>> {
        self.glfw
            .get_required_instance_extensions()
            .ok_or_else(|| WindowError::Glfw("no Vulkan instance extensions reported".to_string()))
    }

    /// Create the Vulkan surface for this window.
    pub fn create_surface(&mut self, instance: ash::vk::Instance) -> WindowResult<ash::vk::SurfaceKHR> {
        let mut surface = ash::vk::SurfaceKHR::null();
        let result = self
            .window
            .create_window_surface(instance, std::ptr::null(), &mut surface);
        if result == ash::vk::Result::SUCCESS {
            Ok(surface)
        } else {
            Err(WindowError::Glfw(format!(
                "surface creation failed: {:?}",
                result
            )))
        }
    }
}

/// Translate an ABI key code (kiln_abi::key values, which are the GLFW
/// codes) into a GLFW key.
fn key_from_code(code: i32) -> Option<glfw::Key> {
    use glfw::Key;
    let key = match code {
        32 => Key::Space,
        48 => Key::Num0,
        49 => Key::Num1,
        50 => Key::Num2,
        51 => Key::Num3,
        52 => Key::Num4,
        53 => Key::Num5,
        54 => Key::Num6,
        55 => Key::Num7,
        56 => Key::Num8,
        57 => Key::Num9,
        65 => Key::A,
        66 => Key::B,
        67 => Key::C,
        68 => Key::D,
        69 => Key::E,
        70 => Key::F,
        71 => Key::G,
        72 => Key::H,
        73 => Key::I,
        74 => Key::J,
        75 => Key::K,
        76 => Key::L,
        77 => Key::M,
        78 => Key::N,
        79 => Key::O,
        80 => Key::P,
        81 => Key::Q,
        82 => Key::R,
        83 => Key::S,
        84 => Key::T,
        85 => Key::U,
        86 => Key::V,
        87 => Key::W,
        88 => Key::X,
        89 => Key::Y,
        90 => Key::Z,
        256 => Key::Escape,
        257 => Key::Enter,
        258 => Key::Tab,
        262 => Key::Right,
        263 => Key::Left,
        264 => Key::Down,
        265 => Key::Up,
        340 => Key::LeftShift,
        341 => Key::LeftControl,
        _ => return None,
    };
    Some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abi_codes_map_to_glfw_keys() {
        assert_eq!(key_from_code(kiln_abi::key::KEY_W), Some(glfw::Key::W));
        assert_eq!(
            key_from_code(kiln_abi::key::KEY_ESCAPE),
            Some(glfw::Key::Escape)
        );
        assert_eq!(key_from_code(-1), None);
        assert_eq!(key_from_code(10_000), None);
    }
}
