use super::backend_error;
use crate::{
    gpu::{ComputePipelineDesc, RawRayTracingPipeline, RayTracingPipelineDesc, ShaderModuleDesc},
    RenderError, Result,
};
use ash::vk;
use std::{collections::HashMap, ffi::CString};

/// ray tracingのpush constantを参照するshader stage
pub(super) const RAY_TRACING_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw(),
);

/// descriptor tableの種類ごとのdescriptor set layoutを作成する
///
/// どのbindingもPARTIALLY_BOUNDで、書き込まれていないスロットがあってもよい。
pub(super) fn create_descriptor_set_layouts(
    device: &ashtray::DeviceHandle,
    capacity: u32,
) -> Result<[ashtray::DescriptorSetLayoutHandle; 2]> {
    let create = |bindings: &[vk::DescriptorSetLayoutBinding]| {
        let binding_flags = vec![vk::DescriptorBindingFlags::PARTIALLY_BOUND; bindings.len()];
        let mut binding_flags_create_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);
        let descriptor_set_layout_create_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(bindings)
            .push_next(&mut binding_flags_create_info);
        device
            .create_descriptor_set_layout(&descriptor_set_layout_create_info)
            .map_err(backend_error)
    };
    let binding = |binding: u32, ty: vk::DescriptorType| {
        vk::DescriptorSetLayoutBinding::builder()
            .binding(binding)
            .descriptor_type(ty)
            .descriptor_count(capacity)
            .stage_flags(vk::ShaderStageFlags::ALL)
            .build()
    };

    // ShaderResource
    let shader_resource = create(&[
        binding(0, vk::DescriptorType::STORAGE_BUFFER),
        binding(1, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR),
    ])?;
    // RenderTarget
    let render_target = create(&[binding(0, vk::DescriptorType::STORAGE_IMAGE)])?;

    Ok([shader_resource, render_target])
}

fn create_pipeline_layout(
    device: &ashtray::DeviceHandle,
    descriptor_set_layouts: &[ashtray::DescriptorSetLayoutHandle; 2],
    push_constant_size: u32,
    stages: vk::ShaderStageFlags,
) -> Result<ashtray::PipelineLayoutHandle> {
    let set_layouts = descriptor_set_layouts
        .iter()
        .map(|layout| layout.raw())
        .collect::<Vec<_>>();
    let push_constant_ranges = if push_constant_size > 0 {
        vec![vk::PushConstantRange::builder()
            .stage_flags(stages)
            .offset(0)
            .size(push_constant_size)
            .build()]
    } else {
        vec![]
    };
    let pipeline_layout_create_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(&set_layouts)
        .push_constant_ranges(&push_constant_ranges);
    device
        .create_pipeline_layout(&pipeline_layout_create_info)
        .map_err(backend_error)
}

fn create_shader_module(
    device: &ashtray::DeviceHandle,
    module: &ShaderModuleDesc,
) -> Result<(ashtray::ShaderModuleHandle, CString)> {
    let entry_point = CString::new(module.entry_point.as_str())
        .map_err(|err| RenderError::PipelineCreation(err.to_string()))?;
    let shader_module = device
        .create_shader_module(&module.spirv)
        .map_err(|err| RenderError::PipelineCreation(err.to_string()))?;
    Ok((shader_module, entry_point))
}

/// ray tracing pipelineとexport名ごとのshader group handle
pub struct VulkanRayTracingPipeline {
    identifiers: HashMap<String, Vec<u8>>,
    pipeline: ashtray::PipelineHandle,
    layout: ashtray::PipelineLayoutHandle,
    push_constant_size: u32,
}
impl VulkanRayTracingPipeline {
    pub(super) fn create(
        device: &ashtray::DeviceHandle,
        descriptor_set_layouts: &[ashtray::DescriptorSetLayoutHandle; 2],
        properties: &ashtray::utils::RayTracingProperties,
        desc: &RayTracingPipelineDesc,
    ) -> Result<Self> {
        let layout = create_pipeline_layout(
            device,
            descriptor_set_layouts,
            desc.push_constant_size,
            RAY_TRACING_STAGES,
        )?;

        // shader stagesの作成
        let modules = desc
            .groups()
            .map(|export| create_shader_module(device, &export.module))
            .collect::<Result<Vec<_>>>()?;
        let stage_flags = std::iter::repeat(vk::ShaderStageFlags::RAYGEN_KHR)
            .take(desc.ray_generation.len())
            .chain(std::iter::repeat(vk::ShaderStageFlags::MISS_KHR).take(desc.miss.len()))
            .chain(std::iter::repeat(vk::ShaderStageFlags::CLOSEST_HIT_KHR).take(desc.hit.len()))
            .collect::<Vec<_>>();
        let shader_stages = modules
            .iter()
            .zip(&stage_flags)
            .map(|((module, entry_point), stage)| {
                vk::PipelineShaderStageCreateInfo::builder()
                    .stage(*stage)
                    .module(module.raw())
                    .name(entry_point)
                    .build()
            })
            .collect::<Vec<_>>();

        // shader groupsの作成
        let shader_groups = stage_flags
            .iter()
            .enumerate()
            .map(|(index, stage)| {
                let index = index as u32;
                if *stage == vk::ShaderStageFlags::CLOSEST_HIT_KHR {
                    vk::RayTracingShaderGroupCreateInfoKHR::builder()
                        .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                        .general_shader(vk::SHADER_UNUSED_KHR)
                        .closest_hit_shader(index)
                        .any_hit_shader(vk::SHADER_UNUSED_KHR)
                        .intersection_shader(vk::SHADER_UNUSED_KHR)
                        .build()
                } else {
                    vk::RayTracingShaderGroupCreateInfoKHR::builder()
                        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
                        .general_shader(index)
                        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
                        .any_hit_shader(vk::SHADER_UNUSED_KHR)
                        .intersection_shader(vk::SHADER_UNUSED_KHR)
                        .build()
                }
            })
            .collect::<Vec<_>>();

        // pipelineを作成
        let pipeline_create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&shader_stages)
            .groups(&shader_groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion_depth.max(1))
            .layout(layout.raw())
            .build();
        let pipeline = device
            .create_ray_tracing_pipeline(&pipeline_create_info)
            .map_err(|err| RenderError::PipelineCreation(err.to_string()))?;

        // shader group handleの取得
        let handle_size = properties.shader_group_handle_size as usize;
        let group_count = shader_groups.len() as u32;
        let handles = device
            .get_ray_tracing_shader_group_handles(
                &pipeline,
                group_count,
                handle_size * group_count as usize,
            )
            .map_err(backend_error)?;
        let identifiers = desc
            .groups()
            .zip(handles.chunks_exact(handle_size))
            .map(|(export, handle)| (export.name.clone(), handle.to_vec()))
            .collect::<HashMap<_, _>>();

        Ok(Self {
            identifiers,
            pipeline,
            layout,
            push_constant_size: desc.push_constant_size,
        })
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline.raw()
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout.raw()
    }

    pub fn push_constant_size(&self) -> u32 {
        self.push_constant_size
    }
}
impl RawRayTracingPipeline for VulkanRayTracingPipeline {
    fn shader_identifier(&self, export: &str) -> Option<&[u8]> {
        self.identifiers.get(export).map(Vec::as_slice)
    }
}

/// compute pipeline
pub struct VulkanComputePipeline {
    label: String,
    pipeline: ashtray::PipelineHandle,
    layout: ashtray::PipelineLayoutHandle,
}
impl VulkanComputePipeline {
    pub(super) fn create(
        device: &ashtray::DeviceHandle,
        descriptor_set_layouts: &[ashtray::DescriptorSetLayoutHandle; 2],
        desc: &ComputePipelineDesc,
    ) -> Result<Self> {
        let layout = create_pipeline_layout(
            device,
            descriptor_set_layouts,
            desc.push_constant_size,
            vk::ShaderStageFlags::COMPUTE,
        )?;
        let (module, entry_point) = create_shader_module(device, &desc.module)?;
        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module.raw())
            .name(&entry_point)
            .build();
        let pipeline_create_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(layout.raw())
            .build();
        let pipeline = device
            .create_compute_pipeline(&pipeline_create_info)
            .map_err(|err| {
                RenderError::PipelineCreation(format!("compute pipeline `{}`: {err}", desc.label))
            })?;
        log::debug!("compute pipeline `{}` created", desc.label);
        Ok(Self {
            label: desc.label.clone(),
            pipeline,
            layout,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline.raw()
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout.raw()
    }
}
