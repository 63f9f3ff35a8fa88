// Bindless descriptor table
//
// One global descriptor set for the whole context: a large partially-bound
// sampled-image array on binding 0 and two fixed samplers on binding 1.
// Image slots come from a strictly increasing allocator; slot 0 is reserved
// as "no texture" and freed slots are never handed out again, so a stale
// slot index can never alias a newer image.

use ash::vk;

use super::device::DeviceContext;
use super::error::{GpuError, Result, VkCall};

pub const BINDLESS_IMAGE_CAPACITY: u32 = 16384;

/// Fixed sampler slots, written once at init.
pub const SAMPLER_NEAREST: u32 = 0;
pub const SAMPLER_LINEAR: u32 = 1;
const SAMPLER_COUNT: u32 = 2;

/// Strictly increasing slot allocator. No reuse; 0 is never allocated.
pub struct SlotAllocator {
    next: u32,
    capacity: u32,
}

impl SlotAllocator {
    pub fn new(capacity: u32) -> Self {
        Self { next: 1, capacity }
    }

    pub fn allocate(&mut self) -> Result<u32> {
        if self.next >= self.capacity {
            return Err(GpuError::MissingCapability(format!(
                "bindless image table exhausted ({} slots)",
                self.capacity
            )));
        }
        let slot = self.next;
        self.next += 1;
        Ok(slot)
    }

    /// Highest slot ever handed out plus one. Monotonic.
    pub fn high_water(&self) -> u32 {
        self.next
    }
}

pub struct BindlessTable {
    pub layout: vk::DescriptorSetLayout,
    pub set: vk::DescriptorSet,
    pool: vk::DescriptorPool,
    samplers: [vk::Sampler; SAMPLER_COUNT as usize],
    slots: SlotAllocator,
}

impl BindlessTable {
    pub fn new(device: &DeviceContext) -> Result<Self> {
        let samplers = [
            Self::create_sampler(device, vk::Filter::NEAREST, 1.0)?,
            Self::create_sampler(
                device,
                vk::Filter::LINEAR,
                device.properties.limits.max_sampler_anisotropy,
            )?,
        ];

        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(BINDLESS_IMAGE_CAPACITY)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(1)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(SAMPLER_COUNT)
                .stage_flags(vk::ShaderStageFlags::ALL)
                .build(),
        ];
        let binding_flags = [
            vk::DescriptorBindingFlags::PARTIALLY_BOUND
                | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
                | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING,
            vk::DescriptorBindingFlags::empty(),
        ];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&binding_flags);
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .push_next(&mut flags_info);
        let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .vk_call("vkCreateDescriptorSetLayout")?;

        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: BINDLESS_IMAGE_CAPACITY,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: SAMPLER_COUNT,
            },
        ];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .vk_call("vkCreateDescriptorPool")?;

        let set_layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);
        let set = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .vk_call("vkAllocateDescriptorSets")?[0];

        let sampler_infos: Vec<_> = samplers
            .iter()
            .map(|&sampler| vk::DescriptorImageInfo {
                sampler,
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            })
            .collect();
        let sampler_write = vk::WriteDescriptorSet::builder()
            .dst_set(set)
            .dst_binding(1)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::SAMPLER)
            .image_info(&sampler_infos)
            .build();
        unsafe { device.device.update_descriptor_sets(&[sampler_write], &[]) };

        log::info!(
            "Created bindless table: {} image slots, {} samplers",
            BINDLESS_IMAGE_CAPACITY,
            SAMPLER_COUNT
        );

        Ok(Self {
            layout,
            set,
            pool,
            samplers,
            slots: SlotAllocator::new(BINDLESS_IMAGE_CAPACITY),
        })
    }

    fn create_sampler(
        device: &DeviceContext,
        filter: vk::Filter,
        max_anisotropy: f32,
    ) -> Result<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(if filter == vk::Filter::LINEAR {
                vk::SamplerMipmapMode::LINEAR
            } else {
                vk::SamplerMipmapMode::NEAREST
            })
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .anisotropy_enable(max_anisotropy > 1.0)
            .max_anisotropy(max_anisotropy)
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);
        unsafe { device.device.create_sampler(&sampler_info, None) }.vk_call("vkCreateSampler")
    }

    /// Allocate a slot and point it at the view. The caller stores the slot
    /// as the image's bind index.
    pub fn register_image(
        &mut self,
        device: &DeviceContext,
        view: vk::ImageView,
    ) -> Result<u32> {
        let slot = self.slots.allocate()?;
        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(0)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(&image_info)
            .build();
        unsafe { device.device.update_descriptor_sets(&[write], &[]) };
        Ok(slot)
    }

    pub fn high_water(&self) -> u32 {
        self.slots.high_water()
    }

    pub fn destroy(&mut self, device: &DeviceContext) {
        unsafe {
            for sampler in self.samplers {
                device.device.destroy_sampler(sampler, None);
            }
            device.device.destroy_descriptor_pool(self.pool, None);
            device.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_unique_nonzero_and_monotonic() {
        let mut slots = SlotAllocator::new(64);
        let mut previous = 0;
        for _ in 0..63 {
            let slot = slots.allocate().unwrap();
            assert_ne!(slot, 0);
            assert!(slot > previous);
            previous = slot;
        }
    }

    #[test]
    fn slot_zero_is_never_allocated() {
        let mut slots = SlotAllocator::new(8);
        while let Ok(slot) = slots.allocate() {
            assert_ne!(slot, 0);
        }
    }

    #[test]
    fn high_water_never_decreases() {
        let mut slots = SlotAllocator::new(16);
        let mut watermark = slots.high_water();
        for _ in 0..10 {
            slots.allocate().unwrap();
            assert!(slots.high_water() > watermark);
            watermark = slots.high_water();
        }
    }

    #[test]
    fn exhaustion_is_a_capability_error() {
        let mut slots = SlotAllocator::new(3);
        assert_eq!(slots.allocate().unwrap(), 1);
        assert_eq!(slots.allocate().unwrap(), 2);
        let err = slots.allocate().unwrap_err();
        assert!(matches!(err, GpuError::MissingCapability(_)));
        // Still exhausted on retry; the counter does not wrap.
        assert!(slots.allocate().is_err());
    }

    #[test]
    fn sampler_slot_constants_are_fixed() {
        assert_eq!(SAMPLER_NEAREST, 0);
        assert_eq!(SAMPLER_LINEAR, 1);
    }
}
