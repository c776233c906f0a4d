use super::{GraphicsBackend, ProbeContext};
use crate::GpuError;
use anyhow::Result;
use ash::vk;
use derivative::Derivative;
use std::ffi::CStr;

/// Probes the first Vulkan physical device through a throwaway instance
#[derive(Debug, Default)]
pub struct VulkanBackend {}

impl VulkanBackend {
    pub fn new() -> Self {
        Self {}
    }
}

impl GraphicsBackend for VulkanBackend {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn open_probe(&self) -> Result<Box<dyn ProbeContext + '_>, GpuError> {
        let probe =
            VulkanProbe::new().map_err(|e| GpuError::ContextUnavailable(format!("{e:#}")))?;
        Ok(Box::new(probe))
    }
}

fn vendor_from_id(vendor_id: u32) -> String {
    match vendor_id {
        0x1002 => "AMD".to_string(),
        0x1010 => "ImgTec".to_string(),
        0x10DE => "NVIDIA".to_string(),
        0x13B5 => "ARM".to_string(),
        0x5143 => "Qualcomm".to_string(),
        0x8086 => "Intel".to_string(),
        0x106B => "Apple".to_string(),
        other => format!("0x{other:04X}"),
    }
}

#[derive(Derivative)]
#[derivative(Debug)]
struct VulkanProbe {
    #[derivative(Debug = "ignore")]
    _entry: ash::Entry,
    #[derivative(Debug = "ignore")]
    instance: ash::Instance,
    /// Created on the first test allocation
    #[derivative(Debug = "ignore")]
    device: Option<ash::Device>,
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
}

impl VulkanProbe {
    fn new() -> Result<Self> {
        let entry = unsafe { ash::Entry::load()? };
        let application_info = vk::ApplicationInfo::default()
            .application_name(c"vista capability probe")
            .api_version(vk::make_api_version(0, 1, 0, 0));
        let instance_ci = vk::InstanceCreateInfo::default().application_info(&application_info);
        let instance = unsafe { entry.create_instance(&instance_ci, None)? };

        let physical_devices = match unsafe { instance.enumerate_physical_devices() } {
            Ok(devices) => devices,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e.into());
            }
        };
        let Some(physical_device) = physical_devices.first().copied() else {
            unsafe { instance.destroy_instance(None) };
            anyhow::bail!("No Vulkan physical device is present");
        };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        tracing::trace!("Opened Vulkan capability probe on {:?}", physical_device);
        Ok(Self {
            _entry: entry,
            instance,
            device: None,
            physical_device,
            properties,
            memory_properties,
        })
    }

    fn device(&mut self) -> Result<&ash::Device, GpuError> {
        if self.device.is_none() {
            let priorities = [1.0f32];
            let queue_ci = vk::DeviceQueueCreateInfo::default()
                .queue_family_index(0)
                .queue_priorities(&priorities);
            let device_ci =
                vk::DeviceCreateInfo::default().queue_create_infos(std::slice::from_ref(&queue_ci));
            let device = unsafe {
                self.instance
                    .create_device(self.physical_device, &device_ci, None)?
            };
            self.device = Some(device);
        }
        self.device
            .as_ref()
            .ok_or_else(|| GpuError::ProbeFault("Logical device missing".to_string()))
    }

    fn device_local_memory_type(&self, type_bits: u32) -> Option<u32> {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .find(|(index, memory_type)| {
                type_bits & (1 << index) != 0
                    && memory_type
                        .property_flags
                        .contains(vk::MemoryPropertyFlags::DEVICE_LOCAL)
            })
            .map(|(index, _)| index as u32)
    }
}

impl ProbeContext for VulkanProbe {
    fn max_texture_dimension(&self) -> u32 {
        self.properties.limits.max_image_dimension2_d
    }

    fn max_texture_units(&self) -> u32 {
        self.properties.limits.max_per_stage_descriptor_sampled_images
    }

    fn max_combined_units(&self) -> u32 {
        self.properties.limits.max_descriptor_set_sampled_images
    }

    fn max_anisotropy(&self) -> f32 {
        self.properties.limits.max_sampler_anisotropy
    }

    fn renderer_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    fn vendor_name(&self) -> String {
        vendor_from_id(self.properties.vendor_id)
    }

    fn allocate_test_texture(&mut self, width: u32, height: u32) -> Result<(), GpuError> {
        let image_ci = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk::Format::R8G8B8A8_UNORM)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let rejected = |code: vk::Result| GpuError::AllocationRejected {
            width,
            height,
            code: code.as_raw(),
        };

        let (image, requirements) = {
            let device = self.device()?;
            let image = unsafe { device.create_image(&image_ci, None) }.map_err(rejected)?;
            let requirements = unsafe { device.get_image_memory_requirements(image) };
            (image, requirements)
        };
        let Some(memory_type_index) = self.device_local_memory_type(requirements.memory_type_bits)
        else {
            if let Some(device) = self.device.as_ref() {
                unsafe { device.destroy_image(image, None) };
            }
            return Err(GpuError::NoSuitableMemoryType);
        };

        let device = self.device()?;
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        let result = unsafe { device.allocate_memory(&allocate_info, None) };
        unsafe {
            if let Ok(memory) = result {
                device.free_memory(memory, None);
            }
            device.destroy_image(image, None);
        }
        result.map(|_| ()).map_err(rejected)
    }
}

impl Drop for VulkanProbe {
    fn drop(&mut self) {
        unsafe {
            if let Some(device) = self.device.take() {
                device.destroy_device(None);
            }
            self.instance.destroy_instance(None);
        }
        tracing::trace!("Destroyed Vulkan capability probe");
    }
}
